/// Quorum Fan-Out Executor Module
///
/// `exec_on_many` runs one operation per peer in parallel and returns early
/// once enough of them have succeeded. The overlay DHT routinely includes
/// slow or unresponsive peers; waiting for all of them is both slow and
/// unnecessary, while a fixed count would discard useful late answers. The
/// termination heuristic combines three conditions:
///
/// 1. once `floor(len(peers) * wait_frac)` operations have succeeded, a
///    500 ms grace ticker is armed,
/// 2. every tick re-arms the ticker if successes grew since the last tick,
///    otherwise the remaining operations are cancelled and the executor
///    returns,
/// 3. independently, once `successes + completions >= len(peers)` the
///    executor cancels and returns at once. The double counting is what
///    makes peer sets that split into fast successes and fast failures
///    terminate without sitting out the grace window.
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// How long to keep collecting after the success quorum is reached, as long
/// as no further successes arrive.
const GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Invoke `op` once per peer under a shared `per_op_timeout` deadline and
/// return the number of successful invocations.
///
/// With `sloppy_exit` the executor returns as soon as the heuristic fires
/// and stragglers keep running detached until their deadline; they must own
/// everything they touch. Without it, cancellation is propagated to the
/// operations and every completion is drained (late successes still count)
/// before the executor returns.
///
/// `wait_frac` must be in (0, 1] and `per_op_timeout` positive. An empty
/// peer set returns 0 immediately. `op` must be safe to invoke
/// concurrently.
pub async fn exec_on_many<P, F, Fut>(
    cancel: &CancellationToken,
    wait_frac: f64,
    per_op_timeout: Duration,
    peers: Vec<P>,
    sloppy_exit: bool,
    op: F,
) -> usize
where
    P: Send + 'static,
    F: Fn(P) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    debug_assert!(wait_frac > 0.0 && wait_frac <= 1.0);
    debug_assert!(per_op_timeout > Duration::ZERO);

    let total = peers.len();
    if total == 0 {
        return 0;
    }
    let threshold = (total as f64 * wait_frac).floor() as usize;

    let child = cancel.child_token();
    let (tx, mut rx) = mpsc::channel(total);
    for peer in peers {
        let fut = op(peer);
        let tx = tx.clone();
        let token = child.clone();
        tokio::spawn(async move {
            let ok = if sloppy_exit {
                // Stragglers outlive the executor; they only race their
                // own deadline.
                matches!(tokio::time::timeout(per_op_timeout, fut).await, Ok(true))
            } else {
                tokio::select! {
                    // An operation that already finished reports its real
                    // outcome even when cancellation races it.
                    biased;
                    res = tokio::time::timeout(per_op_timeout, fut) => matches!(res, Ok(true)),
                    _ = token.cancelled() => false,
                }
            };
            let _ = tx.send(ok).await;
        });
    }
    drop(tx);

    let mut num_success = 0usize;
    let mut num_done = 0usize;
    let mut grace: Option<tokio::time::Interval> = None;
    let mut successes_at_tick = 0usize;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                child.cancel();
                break;
            }
            _ = async { grace.as_mut().expect("ticker armed").tick().await }, if grace.is_some() => {
                if num_success > successes_at_tick {
                    successes_at_tick = num_success;
                } else {
                    trace!(num_success, num_done, total, "grace window expired");
                    child.cancel();
                    break;
                }
            }
            completed = rx.recv() => {
                let Some(ok) = completed else { break };
                num_done += 1;
                if ok {
                    num_success += 1;
                    if grace.is_none() && num_success >= threshold {
                        let mut ticker =
                            interval_at(Instant::now() + GRACE_PERIOD, GRACE_PERIOD);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        grace = Some(ticker);
                        successes_at_tick = num_success;
                    }
                }
                if num_done >= total {
                    break;
                }
                if num_success + num_done >= total {
                    trace!(num_success, num_done, total, "success/completion cutoff");
                    child.cancel();
                    break;
                }
            }
        }
    }

    if !sloppy_exit {
        // Drain every completion; cancelled operations report promptly and
        // genuine late successes still count.
        while num_done < total {
            match rx.recv().await {
                Some(ok) => {
                    num_done += 1;
                    if ok {
                        num_success += 1;
                    }
                }
                None => break,
            }
        }
    }

    num_success
}
