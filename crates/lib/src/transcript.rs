//! Ordered, in-memory chat transcript shared by every reply channel.
//!
//! All mutations take one write lock, so a multi-step change (drop the
//! "processing" placeholder, append the real reply) is never interleaved with
//! an append from another channel. Renderers follow changes through a
//! broadcast subscription.

use crate::adapter::{DisplayEvent, Speaker};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Text of the transient line shown while a reply is pending.
pub const PROCESSING_TEXT: &str = "Processing...";

const CHANGE_CAPACITY: usize = 256;

/// Stable id of a transcript entry (monotonic, never reused).
pub type EntryId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: EntryId,
    #[serde(flatten)]
    pub event: DisplayEvent,
    /// Placeholder that will be removed once the real reply arrives.
    #[serde(skip)]
    pub transient: bool,
}

/// Change notification for renderers.
#[derive(Debug, Clone)]
pub enum TranscriptChange {
    Appended(Entry),
    Removed(EntryId),
    Cleared,
}

#[derive(Default)]
struct Inner {
    next_id: EntryId,
    entries: Vec<Entry>,
}

impl Inner {
    fn push(&mut self, event: DisplayEvent, transient: bool) -> Entry {
        self.next_id += 1;
        let entry = Entry {
            id: self.next_id,
            event,
            transient,
        };
        self.entries.push(entry.clone());
        entry
    }

    fn remove(&mut self, id: EntryId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }
}

/// Shared handle; clones see the same transcript.
#[derive(Clone)]
pub struct Transcript {
    inner: Arc<RwLock<Inner>>,
    changes: broadcast::Sender<TranscriptChange>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes,
        }
    }

    /// Receive every change made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: TranscriptChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    pub async fn append(&self, event: DisplayEvent) -> EntryId {
        let mut g = self.inner.write().await;
        let entry = g.push(event, false);
        let id = entry.id;
        self.notify(TranscriptChange::Appended(entry));
        id
    }

    /// Append a transient system line; resolve it with [`Transcript::resolve_placeholder`].
    pub async fn push_placeholder(&self) -> EntryId {
        let mut g = self.inner.write().await;
        let entry = g.push(DisplayEvent::new(PROCESSING_TEXT, Speaker::System), true);
        let id = entry.id;
        self.notify(TranscriptChange::Appended(entry));
        id
    }

    /// Remove the placeholder and append the reply (if any) under one lock.
    /// Returns the id of the appended reply.
    pub async fn resolve_placeholder(
        &self,
        placeholder: EntryId,
        reply: Option<DisplayEvent>,
    ) -> Option<EntryId> {
        let mut g = self.inner.write().await;
        if g.remove(placeholder) {
            self.notify(TranscriptChange::Removed(placeholder));
        } else {
            log::debug!("transcript: placeholder {} already gone", placeholder);
        }
        let entry = g.push(reply?, false);
        let id = entry.id;
        self.notify(TranscriptChange::Appended(entry));
        Some(id)
    }

    pub async fn remove(&self, id: EntryId) -> bool {
        let mut g = self.inner.write().await;
        let removed = g.remove(id);
        if removed {
            self.notify(TranscriptChange::Removed(id));
        }
        removed
    }

    pub async fn clear(&self) {
        self.inner.write().await.entries.clear();
        self.notify(TranscriptChange::Cleared);
    }

    pub async fn snapshot(&self) -> Vec<Entry> {
        self.inner.read().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// One `speaker: text` line per entry, placeholders excluded.
    pub async fn export_text(&self, names: &SpeakerNames) -> String {
        let g = self.inner.read().await;
        let mut out = String::new();
        for e in g.entries.iter().filter(|e| !e.transient) {
            out.push_str(&names.label(&e.event.speaker));
            out.push_str(": ");
            out.push_str(&e.event.text);
            out.push('\n');
        }
        out
    }

    /// Pretty JSON array of entries, placeholders excluded.
    pub async fn export_json(&self) -> serde_json::Result<String> {
        let g = self.inner.read().await;
        let entries: Vec<&Entry> = g.entries.iter().filter(|e| !e.transient).collect();
        serde_json::to_string_pretty(&entries)
    }
}

/// Labels for speakers that do not carry their own name.
#[derive(Debug, Clone)]
pub struct SpeakerNames {
    pub system: String,
}

impl SpeakerNames {
    pub fn label(&self, speaker: &Speaker) -> String {
        match speaker {
            Speaker::User(n) | Speaker::Responder(n) => n.clone(),
            Speaker::System => self.system.clone(),
            Speaker::Error => format!("{} (error)", self.system),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> SpeakerNames {
        SpeakerNames {
            system: "System".to_string(),
        }
    }

    #[tokio::test]
    async fn appends_keep_insertion_order() {
        let t = Transcript::new();
        t.append(DisplayEvent::user("User", "hi")).await;
        t.append(DisplayEvent::responder("Assistant", "hello")).await;
        let texts: Vec<String> = t.snapshot().await.into_iter().map(|e| e.event.text).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn placeholder_is_replaced_by_reply() {
        let t = Transcript::new();
        t.append(DisplayEvent::user("User", "q")).await;
        let p = t.push_placeholder().await;
        t.append(DisplayEvent::responder("Assistant", "queued reply")).await;
        let reply = t
            .resolve_placeholder(p, Some(DisplayEvent::responder("Assistant", "a")))
            .await;
        assert!(reply.is_some());
        let snap = t.snapshot().await;
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|e| !e.transient));
        assert_eq!(snap[2].event.text, "a");
    }

    #[tokio::test]
    async fn placeholder_without_reply_is_just_removed() {
        let t = Transcript::new();
        let p = t.push_placeholder().await;
        assert_eq!(t.resolve_placeholder(p, None).await, None);
        assert!(t.is_empty().await);
    }

    #[tokio::test]
    async fn subscribers_see_changes_in_order() {
        let t = Transcript::new();
        let mut rx = t.subscribe();
        let p = t.push_placeholder().await;
        t.resolve_placeholder(p, Some(DisplayEvent::system("done"))).await;
        assert!(matches!(rx.recv().await, Ok(TranscriptChange::Appended(e)) if e.transient));
        assert!(matches!(rx.recv().await, Ok(TranscriptChange::Removed(id)) if id == p));
        assert!(matches!(rx.recv().await, Ok(TranscriptChange::Appended(e)) if e.event.text == "done"));
    }

    #[tokio::test]
    async fn export_skips_placeholders() {
        let t = Transcript::new();
        t.append(DisplayEvent::user("User", "hi")).await;
        t.push_placeholder().await;
        t.append(DisplayEvent::error("Error: down")).await;
        assert_eq!(
            t.export_text(&names()).await,
            "User: hi\nSystem (error): Error: down\n"
        );
        let json: serde_json::Value = serde_json::from_str(&t.export_json().await.unwrap()).unwrap();
        assert_eq!(json.as_array().map(|a| a.len()), Some(2));
        assert_eq!(json[0]["speaker"]["kind"], "user");
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let t = Transcript::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                t.append(DisplayEvent::system(format!("m{}", i))).await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = t.snapshot().await;
        assert_eq!(snap.len(), 16);
        assert!(snap.windows(2).all(|w| w[0].id < w[1].id));
    }
}
