use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::Path,
    sync::{Arc, Mutex},
};

/// Appends to a log file and prunes the oldest lines once the file grows past
/// `max_lines`.
#[derive(Clone)]
pub struct CircularFileWriter {
    path: String,
    max_lines: u32,
    lines_since_prune: Arc<Mutex<u32>>,
}

impl CircularFileWriter {
    pub fn new(path: String, max_lines: u32) -> Self {
        Self {
            path,
            max_lines,
            lines_since_prune: Arc::new(Mutex::new(0)),
        }
    }

    fn prune(&self) -> io::Result<()> {
        if !Path::new(&self.path).exists() {
            return Ok(());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;

        if lines.len() > self.max_lines as usize {
            let start = lines.len() - self.max_lines as usize;
            let mut file = File::create(&self.path)?;
            for line in &lines[start..] {
                writeln!(file, "{}", line)?;
            }
        }
        Ok(())
    }
}

impl io::Write for CircularFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf)?;

        let mut pending = self
            .lines_since_prune
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *pending += buf.iter().filter(|&&b| b == b'\n').count() as u32;

        // Prune after 10% of max_lines new lines, at least every 50.
        let prune_threshold = (self.max_lines / 10).max(50);
        if *pending >= prune_threshold {
            if let Err(e) = self.prune() {
                eprintln!("Failed to prune log file: {}", e);
            }
            *pending = 0;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CircularFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_down_to_max_lines() {
        let path = std::env::temp_dir().join(format!("relaylink-log-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut writer = CircularFileWriter::new(path.to_string_lossy().into_owned(), 10);

        for i in 0..60 {
            writeln!(writer, "line {i}").unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines.len() <= 10, "got {} lines", lines.len());
        assert_eq!(lines.last(), Some(&"line 59"));
        let _ = std::fs::remove_file(&path);
    }
}
