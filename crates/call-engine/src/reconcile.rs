use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use call_store::{unix_millis, CallRole, CallSession, CallStatus};
use tokio::time::MissedTickBehavior;

use crate::engine::{ActiveCall, Inner};
use crate::error::EngineError;
use crate::events::CallEvent;

/// The fixed-interval reconciliation loop: polls the session store and
/// drives each registered call toward what the record says, surfacing
/// new incoming rings along the way. A tick still processing when the
/// next is due is skipped, keeping state application strictly ordered.
pub(crate) async fn run_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_failures: u32 = 0;

    tracing::debug!(
        target: "call_engine",
        user = %inner.user_id,
        interval_ms = inner.config.poll_interval.as_millis() as u64,
        "reconciliation loop started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&inner, &mut consecutive_failures).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(target: "call_engine", user = %inner.user_id, "reconciliation loop stopped");
}

async fn tick(inner: &Inner, consecutive_failures: &mut u32) {
    let listed = match inner.store.list_active_for(&inner.user_id).await {
        Ok(sessions) => {
            *consecutive_failures = 0;
            sessions
        }
        Err(err) => {
            // Transient: apply no state, retry next tick. The threshold
            // crossing is reported once per outage.
            *consecutive_failures += 1;
            let err = EngineError::PollFailure(err.to_string());
            tracing::debug!(
                target: "call_engine",
                user = %inner.user_id,
                %err,
                failures = *consecutive_failures,
                "poll failed"
            );
            if *consecutive_failures == inner.config.poll_failure_threshold {
                let _ = inner.events.send(CallEvent::SignalingUnstable {
                    consecutive_failures: *consecutive_failures,
                });
            }
            return;
        }
    };

    let by_id: HashMap<&str, &CallSession> =
        listed.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut calls = inner.calls.lock().await;

    // Surface sessions ringing at this user that we have not seen yet.
    // No media is touched until the user accepts.
    for session in &listed {
        if calls.contains_key(&session.id) {
            continue;
        }
        if session.receiver_id == inner.user_id && session.status == CallStatus::Ringing {
            tracing::info!(
                target: "call_engine",
                call_id = %session.id,
                caller = %session.caller_id,
                "incoming call"
            );
            calls.insert(
                session.id.clone(),
                ActiveCall {
                    role: CallRole::Receiver,
                    last_status: CallStatus::Ringing,
                    registered_at: Instant::now(),
                    negotiation: None,
                },
            );
            let _ = inner.events.send(CallEvent::IncomingCall(session.clone()));
        }
    }

    let now_ms = unix_millis();
    let ring_timeout_ms = inner.config.ring_timeout.as_millis() as u64;
    // A call registered between the fetch and this pass would look
    // vanished; give fresh registrations two poll windows.
    let vanish_exempt = inner.config.poll_interval * 2;
    let mut done: Vec<String> = Vec::new();

    for (call_id, active) in calls.iter_mut() {
        let Some(&session) = by_id.get(call_id.as_str()) else {
            if active.registered_at.elapsed() < vanish_exempt {
                continue;
            }
            // Aged out of the store without us observing the terminal
            // status. End locally anyway.
            tracing::warn!(
                target: "call_engine",
                call_id = %call_id,
                "session vanished from active listing, ending locally"
            );
            if let Some(mut negotiation) = active.negotiation.take() {
                negotiation.close().await;
            }
            let _ = inner.events.send(CallEvent::StatusChanged {
                call_id: call_id.clone(),
                status: CallStatus::Ended,
            });
            done.push(call_id.clone());
            continue;
        };

        if session.status != active.last_status {
            if active.last_status.can_transition_to(session.status) {
                active.last_status = session.status;
                let _ = inner.events.send(CallEvent::StatusChanged {
                    call_id: call_id.clone(),
                    status: session.status,
                });
            } else {
                tracing::warn!(
                    target: "call_engine",
                    call_id = %call_id,
                    from = %active.last_status,
                    to = %session.status,
                    "observed off-graph status transition, ignoring"
                );
            }
        }

        if active.last_status.is_terminal() {
            if let Some(mut negotiation) = active.negotiation.take() {
                negotiation.close().await;
            }
            done.push(call_id.clone());
            continue;
        }

        if let Some(negotiation) = active.negotiation.as_mut() {
            if active.role == CallRole::Caller && !negotiation.answer_applied() {
                if let Some(answer) = session.answer.as_deref() {
                    negotiation.apply_answer(answer).await;
                }
            }
            let remote_role = active.role.opposite();
            let fresh = inner
                .tracker
                .fresh(call_id, remote_role, session.candidates(remote_role));
            if !fresh.is_empty() {
                negotiation.apply_candidates(fresh).await;
            }
        }

        if active.role == CallRole::Caller
            && active.last_status == CallStatus::Ringing
            && session.age_millis(now_ms) > ring_timeout_ms
        {
            tracing::info!(target: "call_engine", call_id = %call_id, "unanswered ring timed out");
            if let Some(mut negotiation) = active.negotiation.take() {
                negotiation.close().await;
            }
            if let Err(err) = inner.store.set_status(call_id, CallStatus::Ended).await {
                tracing::warn!(
                    target: "call_engine",
                    call_id = %call_id,
                    %err,
                    "terminal status write failed"
                );
            }
            let _ = inner.events.send(CallEvent::StatusChanged {
                call_id: call_id.clone(),
                status: CallStatus::Ended,
            });
            done.push(call_id.clone());
        }
    }

    for call_id in done {
        calls.remove(&call_id);
        inner.tracker.forget(&call_id);
    }
}
