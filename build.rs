use std::{fs, path::Path, process::Command};

fn main() {
  println!("cargo:rerun-if-changed=.git/HEAD");
  if Path::new(".git/refs/heads").exists() {
    println!("cargo:rerun-if-changed=.git/refs/heads");
  }

  let (branch, commit) = git_info();
  let short = commit.get(..7).unwrap_or(&commit).to_string();

  println!("cargo:rustc-env=GIT_BRANCH={}", branch);
  println!("cargo:rustc-env=GIT_COMMIT_SHORT={}", short);
}

fn git(args: &[&str]) -> Option<String> {
  let output = Command::new("git").args(args).output().ok()?;
  if !output.status.success() {
    return None;
  }
  Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn git_info() -> (String, String) {
  if let (Some(branch), Some(commit)) = (
    git(&["rev-parse", "--abbrev-ref", "HEAD"]),
    git(&["rev-parse", "HEAD"]),
  ) {
    return (branch, commit);
  }

  // No git binary: read the refs by hand.
  let Ok(head) = fs::read_to_string(".git/HEAD") else {
    return ("unknown".into(), "unknown".into());
  };
  match head.strip_prefix("ref: ") {
    Some(ref_path) => {
      let ref_path = ref_path.trim();
      let branch = ref_path.rsplit('/').next().unwrap_or("unknown").to_string();
      let commit = fs::read_to_string(format!(".git/{}", ref_path))
        .map(|c| c.trim().to_string())
        .unwrap_or_else(|_| "unknown".into());
      (branch, commit)
    }
    None => ("detached".into(), head.trim().to_string()),
  }
}
