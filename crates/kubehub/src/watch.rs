//! List+watch of Capsules feeding the reconcile loop.

use anyhow::Result;
use capsule_core::Capsule;
use futures::TryStreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Send every applied Capsule (and every Capsule in a relist) into `tx`.
/// Deletions need no reconcile: children are garbage collected via owner refs.
pub async fn start_capsule_watcher(client: Client, namespace: Option<&str>, tx: mpsc::Sender<Capsule>) -> Result<()> {
    let api: Api<Capsule> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "capsule watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(c) => {
                if tx.send(c).await.is_err() {
                    break;
                }
            }
            Event::Deleted(c) => {
                debug!(capsule = %c.name_any(), "capsule deleted");
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for c in list {
                    if tx.send(c).await.is_err() {
                        warn!("reconcile queue closed");
                        return Ok(());
                    }
                }
            }
        }
    }
    warn!("capsule watcher stream ended");
    Ok(())
}
