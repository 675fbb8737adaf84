//! Single-task event loop of an agent.
//!
//! A [`Reactor`] multiplexes the agent's inbox, at most one repeating
//! timer and, for the frontend, operator commands. Handlers run one at a
//! time on the task that polls [`Reactor::next_event`], so agent state is
//! never shared and needs no locks.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::transport::Envelope;

/// What a timer tick asks the owner to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    /// Initial bring-up barrier.
    Startup,
    /// Re-synchronization after an application restart.
    StartupReinit,
    /// Waiting for the application to terminate before a restart.
    ApplicationTermination,
}

impl TimerAction {
    pub fn label(self) -> &'static str {
        match self {
            TimerAction::Startup => "startup",
            TimerAction::StartupReinit => "reinit",
            TimerAction::ApplicationTermination => "application termination",
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Message(Envelope),
    Timer(TimerAction),
    /// One line typed by the operator.
    Operator(String),
}

enum Woken {
    Inbox(Option<Envelope>),
    Timer(TimerAction),
    Operator(Option<String>),
}

#[derive(Debug)]
pub struct Reactor {
    inbox: mpsc::UnboundedReceiver<Envelope>,
    timer: Option<(TimerAction, Interval)>,
    operator: Option<mpsc::UnboundedReceiver<String>>,
    stopped: bool,
}

impl Reactor {
    pub fn new(inbox: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Reactor {
            inbox,
            timer: None,
            operator: None,
            stopped: false,
        }
    }

    /// Attaches a stream of operator command lines.
    pub fn attach_operator(&mut self, commands: mpsc::UnboundedReceiver<String>) {
        self.operator = Some(commands);
    }

    /// Replaces any running timer.
    pub fn set_timer(&mut self, action: TimerAction, first: Duration, interval: Duration) {
        let mut ticks = tokio::time::interval_at(Instant::now() + first, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some((action, ticks));
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Makes the next call to [`Reactor::next_event`] return `None`.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Waits for the next event, or `None` once stopped.
    ///
    /// Queued messages win over timer ticks so a barrier check always sees
    /// every heartbeat that had already arrived. A closed operator stream
    /// reads as a final `quit`.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.stopped {
            return None;
        }

        let Reactor {
            inbox,
            timer,
            operator,
            ..
        } = self;

        let tick = async move {
            match timer {
                Some((action, ticks)) => {
                    ticks.tick().await;
                    *action
                }
                None => std::future::pending().await,
            }
        };
        let command = async move {
            match operator {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        let woken = tokio::select! {
            biased;
            envelope = inbox.recv() => Woken::Inbox(envelope),
            action = tick => Woken::Timer(action),
            line = command => Woken::Operator(line),
        };

        match woken {
            Woken::Inbox(Some(envelope)) => Some(Event::Message(envelope)),
            Woken::Inbox(None) => {
                tracing::warn!("agent endpoint closed, leaving event loop");
                self.stopped = true;
                None
            }
            Woken::Timer(action) => Some(Event::Timer(action)),
            Woken::Operator(Some(line)) => Some(Event::Operator(line)),
            Woken::Operator(None) => {
                self.operator = None;
                Some(Event::Operator("quit".to_string()))
            }
        }
    }
}
