use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::{DocRef, Document};

const CHANGE_BUFFER: usize = 1024;

/// In-process fan-out of committed document states. Backends publish here
/// after every commit; subscribers filter for the document they watch.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<Document>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUFFER);
        Self { tx }
    }
}

impl ChangeFeed {
    pub fn publish(&self, doc: Document) {
        // No receivers is the common case, not an error.
        let _ = self.tx.send(doc);
    }

    pub fn subscribe(&self, doc: &DocRef) -> Subscription {
        Subscription {
            doc: doc.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Live view of one document. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    doc: DocRef,
    rx: broadcast::Receiver<Document>,
}

impl Subscription {
    pub fn doc_ref(&self) -> &DocRef {
        &self.doc
    }

    /// Next committed state of the watched document, or `None` once the
    /// store has shut down.
    pub async fn next(&mut self) -> Option<Document> {
        loop {
            match self.rx.recv().await {
                Ok(doc) if doc.collection == self.doc.collection && doc.id == self.doc.id => {
                    return Some(doc);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscription to {} lagged, skipped {} changes", self.doc, skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Document> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|doc| (doc, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, n: u64) -> Document {
        Document {
            collection: "wall_items".to_string(),
            id: id.to_string(),
            data: json!({ "support_count": n }),
            version: n,
        }
    }

    #[tokio::test]
    async fn subscription_only_sees_its_document() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(&DocRef::new("wall_items", "1"));

        feed.publish(doc("2", 1));
        feed.publish(doc("1", 2));

        let seen = sub.next().await.unwrap();
        assert_eq!(seen.id, "1");
        assert_eq!(seen.version, 2);
    }
}
