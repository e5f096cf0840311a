// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Single-consumer broadcast loop fanning messages out to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BroadcastItem, BrokerInner};
use crate::session::{RetainedMessage, SessionState};

/// Consume the broadcast queue strictly FIFO until shutdown.
///
/// Dispatch to subscribers is concurrent: one publish task per connected
/// target, reaped from the front of a FIFO so memory stays bounded
/// without cancelling inflight flows.
pub(crate) async fn broadcast_loop(
    inner: Arc<BrokerInner>,
    mut broadcast_rx: UnboundedReceiver<BroadcastItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    log::debug!("broker: Broadcast loop started");
    let mut running_tasks: VecDeque<JoinHandle<()>> = VecDeque::new();

    loop {
        while running_tasks
            .front()
            .map_or(false, JoinHandle::is_finished)
        {
            running_tasks.pop_front();
        }

        tokio::select! {
            item = broadcast_rx.recv() => match item {
                Some(item) => {
                    inner.broadcast_depth.fetch_sub(1, Ordering::SeqCst);
                    dispatch(&inner, &item, &mut running_tasks);
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Wait until current broadcasting tasks end.
    for task in running_tasks {
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                log::error!("broker: Broadcast task failed: {err}");
            }
        }
    }
    log::debug!("broker: Broadcast loop stopped");
}

fn dispatch(
    inner: &Arc<BrokerInner>,
    item: &BroadcastItem,
    running_tasks: &mut VecDeque<JoinHandle<()>>,
) {
    log::debug!(
        "broker: Broadcasting message on {} from {:?}",
        item.topic,
        item.source_client_id
    );

    // The compiled matcher skips `$` topics for filters beginning with a
    // wildcard [MQTT-4.7.2-1].
    let matches = inner.subscriptions.lock().unwrap().matches(&item.topic);
    for (client_id, sub_qos) in matches {
        // The broker may only reduce the delivery QoS.
        let qos = item.qos_override.unwrap_or(sub_qos).min(sub_qos);

        let target = {
            let sessions = inner.sessions.lock().unwrap();
            sessions.get(&client_id).map(|entry| {
                (
                    Arc::clone(&entry.session),
                    entry.handler.as_ref().map(Arc::clone),
                )
            })
        };
        let Some((session, handler)) = target else {
            log::debug!("broker: Subscriber {client_id} has no session, skipped");
            continue;
        };

        let connected = session.lock().unwrap().state() == SessionState::Connected;
        match handler {
            Some(handler) if connected => {
                let topic = item.topic.clone();
                let data = item.data.clone();
                running_tasks.push_back(tokio::spawn(async move {
                    if let Err(err) = handler.publish(&topic, data, qos, false, None).await {
                        log::warn!(
                            "broker: Failed to publish to {}: {err}",
                            handler.client_id()
                        );
                    }
                }));
            }
            _ => {
                // Keep the message for delivery when the session reconnects.
                log::debug!("broker: Session {client_id} is not connected, retaining message");
                session.lock().unwrap().push_retained(RetainedMessage::new(
                    item.source_client_id.clone(),
                    &item.topic,
                    item.data.clone(),
                    qos,
                ));
            }
        }
    }
}
