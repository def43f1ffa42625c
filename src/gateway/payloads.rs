use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{configs::GatewayConfig, gateway::constants::DEFAULT_SHARD_COUNT};

/// Our own mute/deaf/video flags in a voice channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
    pub self_video: bool,
}

/// Filters of a GUILD_SUBSCRIPTIONS update. Unset fields are sent as null.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GuildSubscriptions {
    pub activities: Option<bool>,
    /// Channel id to member list ranges, e.g. `{"123": [[0, 99]]}`.
    pub channels: Option<Value>,
    pub members: Option<Vec<String>>,
    pub typing: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuildMembersRequest {
    pub query: String,
    pub limit: u32,
    pub presences: Option<bool>,
    pub user_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyVoiceState {
    pub lobby_id: String,
    pub self_deaf: bool,
    pub self_mute: bool,
}

pub fn identify(token: &str, config: &GatewayConfig) -> Value {
    let mut d = json!({
        "compress": false,
        "guild_subscriptions": config.guild_subscriptions,
        "large_threshold": config.large_threshold,
        "properties": config.properties,
        "token": token,
    });
    if config.shard_count > DEFAULT_SHARD_COUNT {
        d["shard"] = json!([config.shard_id, config.shard_count]);
    }
    if let Some(presence) = &config.presence {
        d["presence"] = presence.clone();
    }
    if let Some(intents) = config.intents {
        d["intents"] = json!(intents);
    }
    d
}

/// A zero sequence goes out as null.
pub fn resume(token: &str, session_id: Option<&str>, sequence: u64) -> Value {
    json!({
        "seq": (sequence != 0).then_some(sequence),
        "session_id": session_id,
        "token": token,
    })
}

pub fn voice_state(
    guild_id: Option<&str>,
    channel_id: Option<&str>,
    options: VoiceStateOptions,
) -> Value {
    json!({
        "channel_id": channel_id,
        "guild_id": guild_id,
        "self_deaf": options.self_deaf,
        "self_mute": options.self_mute,
        "self_video": options.self_video,
    })
}

pub fn request_guild_members(guild_ids: &[String], request: &GuildMembersRequest) -> Value {
    let guild_id = match guild_ids {
        [single] => json!(single),
        many => json!(many),
    };
    json!({
        "guild_id": guild_id,
        "limit": request.limit,
        "presences": request.presences,
        "query": request.query,
        "user_ids": request.user_ids,
    })
}

pub fn guild_subscriptions(guild_id: &str, subscriptions: &GuildSubscriptions) -> Value {
    json!({
        "activities": subscriptions.activities,
        "channels": subscriptions.channels,
        "guild_id": guild_id,
        "members": subscriptions.members,
        "typing": subscriptions.typing,
    })
}

pub fn call_connect(channel_id: &str) -> Value {
    json!({ "channel_id": channel_id })
}

pub fn lobby_connect(lobby_id: &str, lobby_secret: &str) -> Value {
    json!({ "lobby_id": lobby_id, "lobby_secret": lobby_secret })
}

pub fn lobby_disconnect(lobby_id: &str) -> Value {
    json!({ "lobby_id": lobby_id })
}

pub fn lobby_voice_states(states: &[LobbyVoiceState]) -> Value {
    json!(states)
}

pub fn stream_create(guild_id: &str, channel_id: &str) -> Value {
    json!({ "channel_id": channel_id, "guild_id": guild_id, "type": "guild" })
}

pub fn stream_key(stream_key: &str) -> Value {
    json!({ "stream_key": stream_key })
}

pub fn stream_set_paused(stream_key: &str, paused: bool) -> Value {
    json!({ "stream_key": stream_key, "paused": paused })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_adds_shard_only_when_sharded() {
        let mut config = GatewayConfig::default();
        let d = identify("tok", &config);
        assert_eq!(d["token"], "tok");
        assert_eq!(d["compress"], false);
        assert_eq!(d["large_threshold"], 250);
        assert!(d.get("shard").is_none());
        assert!(d.get("presence").is_none());
        assert!(d["properties"]["$browser"].as_str().unwrap().starts_with("relaylink/"));

        config.shard_id = 1;
        config.shard_count = 4;
        config.intents = Some(513);
        config.presence = Some(json!({ "status": "idle" }));
        let d = identify("tok", &config);
        assert_eq!(d["shard"], json!([1, 4]));
        assert_eq!(d["intents"], 513);
        assert_eq!(d["presence"]["status"], "idle");
    }

    #[test]
    fn resume_sends_null_for_an_unset_sequence() {
        assert_eq!(resume("tok", Some("abc"), 0)["seq"], Value::Null);
        let d = resume("tok", Some("abc"), 10);
        assert_eq!(d, json!({ "seq": 10, "session_id": "abc", "token": "tok" }));
    }

    #[test]
    fn voice_state_leave() {
        let d = voice_state(Some("g"), None, VoiceStateOptions::default());
        assert_eq!(
            d,
            json!({
                "channel_id": null,
                "guild_id": "g",
                "self_deaf": false,
                "self_mute": false,
                "self_video": false,
            })
        );
    }

    #[test]
    fn member_request_collapses_a_single_guild() {
        let request = GuildMembersRequest {
            limit: 10,
            ..Default::default()
        };
        let single = request_guild_members(&["1".into()], &request);
        assert_eq!(single["guild_id"], "1");
        let many = request_guild_members(&["1".into(), "2".into()], &request);
        assert_eq!(many["guild_id"], json!(["1", "2"]));
        assert_eq!(many["user_ids"], Value::Null);
    }
}
