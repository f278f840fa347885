//! Hierarchical cancellation.
//!
//! A [`Lifetime`] is cancelled either directly or when any of its ancestors
//! is cancelled. The service owns the root; every connection gets a child,
//! and every inbound request a grandchild, so that shutting the service down
//! reaches every in-flight operation.

use futures::future::{select_all, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Result, StrongboxError};

#[derive(Clone)]
pub struct Lifetime {
    node: Arc<Node>,
}

struct Node {
    flag: watch::Sender<bool>,
    parent: Option<Lifetime>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime {
    /// A root lifetime with no parent.
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            node: Arc::new(Node { flag, parent: None }),
        }
    }

    /// A lifetime that ends when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            node: Arc::new(Node {
                flag,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.node.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(self);
        while let Some(lifetime) = current {
            if *lifetime.node.flag.borrow() {
                return true;
            }
            current = lifetime.node.parent.as_ref();
        }
        false
    }

    /// Resolves once this lifetime or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut waits: Vec<BoxFuture<'static, ()>> = Vec::new();
        let mut current = Some(self);
        while let Some(lifetime) = current {
            let mut rx = lifetime.node.flag.subscribe();
            waits.push(
                async move {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                .boxed(),
            );
            current = lifetime.node.parent.as_ref();
        }
        select_all(waits).await;
    }

    /// Run `fut` unless the lifetime ends first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(StrongboxError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StrongboxError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelling_a_parent_reaches_grandchildren() {
        let root = Lifetime::new();
        let connection = root.child();
        let request = connection.child();

        assert!(!request.is_cancelled());
        root.cancel();
        assert!(request.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), request.cancelled())
            .await
            .expect("grandchild should observe cancellation");
    }

    #[tokio::test]
    async fn cancelling_a_child_leaves_siblings_alone() {
        let root = Lifetime::new();
        let a = root.child();
        let b = root.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn guard_stops_pending_work() {
        let lifetime = Lifetime::new();
        let trigger = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = lifetime
            .guard(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert!(matches!(result, Err(StrongboxError::Cancelled)));
    }

    #[tokio::test]
    async fn guard_passes_through_completed_work() {
        let lifetime = Lifetime::new();
        let value = lifetime.guard(async { 7 }).await.expect("not cancelled");
        assert_eq!(value, 7);
    }
}
