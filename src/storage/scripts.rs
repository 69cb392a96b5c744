// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-side scripts that make toggles atomic.
//!
//! Each script reads, checks and writes all of its keys in one round trip, so
//! two toggles for the same actor+item from different processes serialize in
//! the store itself. The in-memory store executes the same semantics under a
//! single script lock.
//!
//! Reply convention for toggle scripts: `nil` means the state check failed
//! (already liked / not liked), otherwise the marker that was written (confirm)
//! or removed (cancel) is returned.

/// Confirm with a ledger delta: check UserState, `HINCRBY ledger +1`, set marker.
///
/// KEYS: ledger hash, user-state hash.
/// ARGV: ledger field, item, marker, ledger ttl (seconds, 0 = none).
pub const CONFIRM_WITH_LEDGER: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[2]) == 1 then
    return false
end
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
if tonumber(ARGV[4]) > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[4])
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
return ARGV[3]
"#;

/// Cancel with a ledger delta: check UserState, `HINCRBY ledger -1`, clear marker.
///
/// KEYS: ledger hash, user-state hash.
/// ARGV: ledger field, item, ledger ttl.
pub const CANCEL_WITH_LEDGER: &str = r#"
local marker = redis.call('HGET', KEYS[2], ARGV[2])
if not marker then
    return false
end
redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if tonumber(ARGV[3]) > 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
end
redis.call('HDEL', KEYS[2], ARGV[2])
return marker
"#;

/// Confirm against UserState only (event-driven mode).
///
/// KEYS: user-state hash. ARGV: item, marker.
pub const CONFIRM_STATE_ONLY: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    return false
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return ARGV[2]
"#;

/// Cancel against UserState only (event-driven mode).
///
/// KEYS: user-state hash. ARGV: item.
pub const CANCEL_STATE_ONLY: &str = r#"
local marker = redis.call('HGET', KEYS[1], ARGV[1])
if not marker then
    return false
end
redis.call('HDEL', KEYS[1], ARGV[1])
return marker
"#;

/// Delete ledger fields whose value is still the one that was flushed.
///
/// KEYS: ledger hash. ARGV: field1, value1, field2, value2, ...
pub const RELEASE_LEDGER: &str = r#"
local released = 0
for i = 1, #ARGV, 2 do
    if redis.call('HGET', KEYS[1], ARGV[i]) == ARGV[i + 1] then
        redis.call('HDEL', KEYS[1], ARGV[i])
        released = released + 1
    end
end
return released
"#;

/// Where a toggle writes its ledger delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTouch {
    /// Ledger hash key for the current slice
    pub key: String,
    /// `"{actor}:{item}"`
    pub field: String,
    /// TTL applied to the ledger hash on every write (0 = none)
    pub ttl_secs: u64,
}

/// One invocation of a server-side script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCall {
    /// Absent → Liked. With a ledger touch in ledger mode, state-only otherwise.
    Confirm {
        user_key: String,
        item: String,
        marker: String,
        ledger: Option<LedgerTouch>,
    },
    /// Liked → Absent.
    Cancel {
        user_key: String,
        item: String,
        ledger: Option<LedgerTouch>,
    },
    /// Compare-and-delete of flushed ledger fields.
    ReleaseLedger {
        ledger_key: String,
        entries: Vec<(String, String)>,
    },
}

impl ScriptCall {
    /// Short name for logs and retry labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Confirm { ledger: Some(_), .. } => "confirm_with_ledger",
            Self::Confirm { ledger: None, .. } => "confirm_state_only",
            Self::Cancel { ledger: Some(_), .. } => "cancel_with_ledger",
            Self::Cancel { ledger: None, .. } => "cancel_state_only",
            Self::ReleaseLedger { .. } => "release_ledger",
        }
    }
}

/// Result of a [`ScriptCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The toggle went through; carries the marker written or removed.
    Applied { marker: String },
    /// The state check failed; nothing was written.
    Rejected,
    /// Number of ledger fields released.
    Released(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_names_follow_variant() {
        let touch = LedgerTouch { key: "l".into(), field: "1:2".into(), ttl_secs: 0 };
        let confirm = ScriptCall::Confirm {
            user_key: "u".into(),
            item: "2".into(),
            marker: "1".into(),
            ledger: Some(touch),
        };
        assert_eq!(confirm.name(), "confirm_with_ledger");

        let cancel = ScriptCall::Cancel { user_key: "u".into(), item: "2".into(), ledger: None };
        assert_eq!(cancel.name(), "cancel_state_only");
    }

    #[test]
    fn test_toggle_scripts_reject_with_nil() {
        for script in [CONFIRM_WITH_LEDGER, CANCEL_WITH_LEDGER, CONFIRM_STATE_ONLY, CANCEL_STATE_ONLY] {
            assert!(script.contains("return false"));
        }
    }
}
