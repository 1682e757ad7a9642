//! Out-of-band advisory validation of entry signals.
//!
//! An [`Advisor`] runs on its own thread and talks to the bot over `mpsc`
//! channels. The bot requests advice when a signal opens and resolves it on
//! the confirmation bar, waiting at most the configured timeout measured
//! from the request. Late or mismatched answers are discarded and the bot
//! proceeds on its technical score.

use crate::domain::{Side, SignalId};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub signal_id: SignalId,
    pub symbol: String,
    pub side: Side,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryVerdict {
    pub approve: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// External validator. Errors are reported as strings; they never stop the bot.
pub trait Advisor: Send + 'static {
    fn advise(&mut self, request: &AdvisoryRequest) -> Result<AdvisoryVerdict, String>;
}

impl<F> Advisor for F
where
    F: FnMut(&AdvisoryRequest) -> Result<AdvisoryVerdict, String> + Send + 'static,
{
    fn advise(&mut self, request: &AdvisoryRequest) -> Result<AdvisoryVerdict, String> {
        self(request)
    }
}

/// What the bot learns when it resolves a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvisoryOutcome {
    Approved(AdvisoryVerdict),
    Rejected(AdvisoryVerdict),
    /// No answer within the timeout: use the technical score.
    TimedOut,
    /// The advisor failed: use the technical score.
    Failed(String),
    /// Nothing was requested for this signal.
    NotRequested,
}

enum Command {
    Advise(AdvisoryRequest),
    Shutdown,
}

struct Response {
    signal_id: SignalId,
    result: Result<AdvisoryVerdict, String>,
}

pub struct AdvisoryWorker {
    tx: Sender<Command>,
    rx: Receiver<Response>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
    outstanding: Option<(SignalId, Instant)>,
}

impl AdvisoryWorker {
    pub fn spawn(advisor: impl Advisor, timeout: Duration) -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (resp_tx, resp_rx) = mpsc::channel::<Response>();
        let handle = thread::Builder::new()
            .name("rulelab-advisory".into())
            .spawn(move || worker_loop(advisor, cmd_rx, resp_tx))?;
        Ok(Self {
            tx: cmd_tx,
            rx: resp_rx,
            handle: Some(handle),
            timeout,
            outstanding: None,
        })
    }

    /// Ask for advice on a freshly opened signal. Replaces any outstanding request.
    pub fn request(&mut self, request: AdvisoryRequest) {
        let id = request.signal_id;
        if self.tx.send(Command::Advise(request)).is_err() {
            warn!(signal = %id, "advisory worker is gone, continuing without advice");
            self.outstanding = None;
            return;
        }
        self.outstanding = Some((id, Instant::now()));
    }

    /// Resolve the advice for `signal_id`, waiting out the rest of the timeout.
    pub fn resolve(&mut self, signal_id: SignalId) -> AdvisoryOutcome {
        let Some((id, requested_at)) = self.outstanding.take() else {
            return AdvisoryOutcome::NotRequested;
        };
        if id != signal_id {
            debug!(outstanding = %id, requested = %signal_id, "advice requested for a different signal");
            return AdvisoryOutcome::NotRequested;
        }

        let deadline = requested_at + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(resp) if resp.signal_id == signal_id => {
                    return match resp.result {
                        Ok(v) if v.approve => AdvisoryOutcome::Approved(v),
                        Ok(v) => AdvisoryOutcome::Rejected(v),
                        Err(e) => {
                            warn!(signal = %signal_id, error = %e, "advisory call failed");
                            AdvisoryOutcome::Failed(e)
                        }
                    };
                }
                Ok(stale) => {
                    debug!(signal = %stale.signal_id, "discarding late advisory result");
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!(signal = %signal_id, "advisory timed out");
                    return AdvisoryOutcome::TimedOut;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return AdvisoryOutcome::Failed("advisory worker disconnected".into());
                }
            }
        }
    }

    /// Drop the outstanding request (signal expired or bot paused).
    pub fn abandon(&mut self) {
        self.outstanding = None;
    }
}

impl Drop for AdvisoryWorker {
    /// Never waits on the advisor: a thread still inside a call is detached
    /// and exits once the call returns and finds the channel closed.
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("advisory worker busy, detaching");
            }
        }
    }
}

impl std::fmt::Debug for AdvisoryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryWorker")
            .field("timeout", &self.timeout)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

fn worker_loop(mut advisor: impl Advisor, rx: Receiver<Command>, tx: Sender<Response>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Advise(request) => {
                let result = advisor.advise(&request);
                let sent = tx.send(Response {
                    signal_id: request.signal_id,
                    result,
                });
                if sent.is_err() {
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64) -> AdvisoryRequest {
        AdvisoryRequest {
            signal_id: SignalId(id),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            score: 0.82,
            reasons: vec!["trend_alignment=1.00".into()],
        }
    }

    #[test]
    fn approves_within_timeout() {
        let mut w = AdvisoryWorker::spawn(
            |r: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> {
                Ok(AdvisoryVerdict {
                    approve: r.score > 0.5,
                    note: None,
                })
            },
            Duration::from_secs(5),
        )
        .unwrap();
        w.request(request(1));
        assert!(matches!(w.resolve(SignalId(1)), AdvisoryOutcome::Approved(_)));
        assert_eq!(w.resolve(SignalId(1)), AdvisoryOutcome::NotRequested);
    }

    #[test]
    fn slow_advisor_times_out() {
        let mut w = AdvisoryWorker::spawn(
            |_: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> {
                thread::sleep(Duration::from_millis(300));
                Ok(AdvisoryVerdict {
                    approve: false,
                    note: None,
                })
            },
            Duration::from_millis(20),
        )
        .unwrap();
        w.request(request(1));
        assert_eq!(w.resolve(SignalId(1)), AdvisoryOutcome::TimedOut);
    }

    #[test]
    fn dropping_worker_does_not_wait_for_hung_advisor() {
        let mut w = AdvisoryWorker::spawn(
            |_: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> {
                thread::sleep(Duration::from_secs(3));
                Ok(AdvisoryVerdict {
                    approve: true,
                    note: None,
                })
            },
            Duration::from_millis(10),
        )
        .unwrap();
        w.request(request(1));
        assert_eq!(w.resolve(SignalId(1)), AdvisoryOutcome::TimedOut);

        let started = Instant::now();
        drop(w);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn failure_is_reported_not_raised() {
        let mut w = AdvisoryWorker::spawn(
            |_: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> { Err("upstream 503".to_string()) },
            Duration::from_secs(5),
        )
        .unwrap();
        w.request(request(7));
        assert_eq!(w.resolve(SignalId(7)), AdvisoryOutcome::Failed("upstream 503".into()));
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut w = AdvisoryWorker::spawn(
            |r: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> {
                Ok(AdvisoryVerdict {
                    approve: r.signal_id == SignalId(2),
                    note: None,
                })
            },
            Duration::from_secs(5),
        )
        .unwrap();
        w.request(request(1));
        w.request(request(2));
        assert!(matches!(w.resolve(SignalId(2)), AdvisoryOutcome::Approved(_)));
    }
}
