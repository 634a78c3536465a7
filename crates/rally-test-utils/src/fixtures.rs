//! Document builders and timestamp helpers for tests.

use chrono::Utc;
use mongodb::bson::DateTime;

use common::types::SignalMessage;
use rally_service::store::documents::{ParticipantDoc, SignalDoc};

/// A BSON timestamp `secs` seconds in the past.
pub fn seconds_ago(secs: i64) -> DateTime {
    DateTime::from_chrono(Utc::now() - chrono::Duration::seconds(secs))
}

/// Build a participant document with sensible defaults.
pub fn participant(id: &str, hunt: &str, call: &str, user: &str, server: &str) -> ParticipantDoc {
    ParticipantDoc {
        id: id.to_string(),
        hunt: hunt.to_string(),
        call: call.to_string(),
        tab: format!("tab-{id}"),
        server: server.to_string(),
        created_by: user.to_string(),
        muted: false,
        deafened: false,
        deleted: false,
    }
}

/// Build a signal mailbox document with an explicit creation time.
pub fn signal(
    sender: &str,
    target: &str,
    messages: Vec<SignalMessage>,
    created_at: DateTime,
) -> SignalDoc {
    SignalDoc {
        id: format!("sig-{sender}-{target}"),
        sender: sender.to_string(),
        target: target.to_string(),
        messages,
        created_at,
    }
}
