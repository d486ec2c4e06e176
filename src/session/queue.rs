use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingQueueEntry {
    pub conversation_id: String,
    pub team_id: String,
    pub enqueued_at: DateTime<Utc>,
}

type Fifo = Arc<Mutex<VecDeque<WaitingQueueEntry>>>;

/// One FIFO per team, each behind its own lock.
#[derive(Default)]
pub struct TeamQueues {
    queues: DashMap<String, Fifo>,
}

impl TeamQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn fifo(&self, team_id: &str) -> Fifo {
        self.queues
            .entry(team_id.to_string())
            .or_default()
            .clone()
    }

    /// Append unless already queued; returns the 1-based position.
    pub async fn enqueue(&self, team_id: &str, conversation_id: &str) -> usize {
        let fifo = self.fifo(team_id);
        let mut q = fifo.lock().await;
        if let Some(pos) = q.iter().position(|e| e.conversation_id == conversation_id) {
            return pos + 1;
        }
        q.push_back(WaitingQueueEntry {
            conversation_id: conversation_id.to_string(),
            team_id: team_id.to_string(),
            enqueued_at: Utc::now(),
        });
        q.len()
    }

    /// Put an entry back at the head, keeping its original timestamp.
    pub async fn requeue_front(&self, entry: WaitingQueueEntry) {
        let fifo = self.fifo(&entry.team_id);
        let mut q = fifo.lock().await;
        if !q.iter().any(|e| e.conversation_id == entry.conversation_id) {
            q.push_front(entry);
        }
    }

    pub async fn pop_front(&self, team_id: &str) -> Option<WaitingQueueEntry> {
        self.fifo(team_id).lock().await.pop_front()
    }

    pub async fn remove(&self, team_id: &str, conversation_id: &str) -> bool {
        let fifo = self.fifo(team_id);
        let mut q = fifo.lock().await;
        let before = q.len();
        q.retain(|e| e.conversation_id != conversation_id);
        q.len() != before
    }

    pub async fn position(&self, team_id: &str, conversation_id: &str) -> Option<usize> {
        self.fifo(team_id)
            .lock()
            .await
            .iter()
            .position(|e| e.conversation_id == conversation_id)
            .map(|p| p + 1)
    }

    pub async fn snapshot(&self, team_id: &str) -> Vec<WaitingQueueEntry> {
        self.fifo(team_id).lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_per_team() {
        let queues = TeamQueues::new();
        assert_eq!(queues.enqueue("sales", "c1").await, 1);
        assert_eq!(queues.enqueue("sales", "c2").await, 2);
        assert_eq!(queues.enqueue("support", "c3").await, 1);
        // no duplicates
        assert_eq!(queues.enqueue("sales", "c1").await, 1);

        assert_eq!(queues.pop_front("sales").await.unwrap().conversation_id, "c1");
        assert_eq!(queues.position("sales", "c2").await, Some(1));
        assert_eq!(queues.snapshot("support").await.len(), 1);
    }

    #[tokio::test]
    async fn remove_and_requeue() {
        let queues = TeamQueues::new();
        queues.enqueue("sales", "c1").await;
        queues.enqueue("sales", "c2").await;
        assert!(queues.remove("sales", "c2").await);
        assert!(!queues.remove("sales", "c2").await);

        let head = queues.pop_front("sales").await.unwrap();
        queues.enqueue("sales", "c3").await;
        queues.requeue_front(head).await;
        let ids: Vec<String> = queues
            .snapshot("sales")
            .await
            .into_iter()
            .map(|e| e.conversation_id)
            .collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert!(queues.pop_front("nobody").await.is_none());
    }
}
