//! SENDME flow control (circuit- and stream-level windows).
//!
//! Every hop tracks how many cells it is still allowed to send before it
//! must stop and wait for a SENDME acknowledging receipt, and how many it
//! has received since it last sent one. Circuit windows bound all traffic
//! on a circuit; each stream multiplexed over it additionally has its own,
//! smaller window, so one slow stream can't starve the others' fair share.

use crate::error::{Result, TorError};

/// Shared accounting for a one-directional SENDME window: decrement on
/// every cell, and report when the window has run dry and needs resetting.
#[derive(Debug, Clone, Copy)]
struct Window {
    remaining: u16,
    increment: u16,
}

impl Window {
    fn new(initial: u16, increment: u16) -> Self {
        Self { remaining: initial, increment }
    }

    fn step(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.increment;
            true
        } else {
            false
        }
    }
}

/// Circuit-level flow control (initial window 1000 cells, increment 100).
/// Independent of any stream's window; a circuit can be send-blocked even
/// while its streams still have room, and vice versa.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    send_window: u16,
    recv: Window,
    deliver_window: u16,
}

impl CircuitFlowControl {
    pub const INITIAL_WINDOW: u16 = 1000;
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            recv: Window::new(Self::WINDOW_INCREMENT, Self::WINDOW_INCREMENT),
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    pub fn on_send(&mut self) -> Result<()> {
        if self.send_window == 0 {
            return Err(TorError::FlowControlViolation("circuit send window exhausted".into()));
        }
        self.send_window -= 1;
        Ok(())
    }

    pub fn on_sendme_received(&mut self) {
        self.send_window += Self::WINDOW_INCREMENT;
        tracing::debug!(send_window = self.send_window, "circuit SENDME received");
    }

    /// Account for a received relay cell. Returns `true` once the receive
    /// window has run dry, meaning a SENDME is due back to the sender.
    pub fn on_receive(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        let due = self.recv.step();
        if due {
            tracing::debug!("circuit recv window depleted, SENDME due");
        }
        due
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control (initial window 500 cells, increment 50).
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    send_window: u16,
    recv: Window,
    stream_id: u16,
}

impl StreamFlowControl {
    pub const INITIAL_WINDOW: u16 = 500;
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            recv: Window::new(Self::WINDOW_INCREMENT, Self::WINDOW_INCREMENT),
            stream_id,
        }
    }

    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    pub fn is_blocked(&self) -> bool {
        !self.can_send()
    }

    pub fn on_send(&mut self) -> Result<()> {
        if self.send_window == 0 {
            return Err(TorError::FlowControlViolation(format!(
                "stream {} send window exhausted",
                self.stream_id
            )));
        }
        self.send_window -= 1;
        Ok(())
    }

    pub fn on_sendme_received(&mut self) {
        self.send_window += Self::WINDOW_INCREMENT;
        tracing::debug!(stream_id = self.stream_id, send_window = self.send_window, "stream SENDME received");
    }

    /// Account for a received DATA cell. Returns `true` once the receive
    /// window has run dry, meaning a SENDME is due back to the sender.
    pub fn on_receive_data(&mut self) -> bool {
        let due = self.recv.step();
        if due {
            tracing::debug!(stream_id = self.stream_id, "stream recv window depleted, SENDME due");
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_send_window_tracks_sends_and_sendmes() {
        let mut fc = CircuitFlowControl::new();
        assert_eq!(fc.send_window, 1000);
        for _ in 0..10 {
            fc.on_send().unwrap();
        }
        assert_eq!(fc.send_window, 990);
        fc.on_sendme_received();
        assert_eq!(fc.send_window, 1090);
    }

    #[test]
    fn circuit_send_blocks_at_zero_and_unblocks_on_sendme() {
        let mut fc = CircuitFlowControl::new();
        for _ in 0..1000 {
            fc.on_send().unwrap();
        }
        assert!(fc.on_send().is_err());
        assert!(!fc.can_send());
        fc.on_sendme_received();
        assert!(fc.can_send());
        assert_eq!(fc.send_window, 100);
    }

    #[test]
    fn circuit_recv_window_fires_sendme_exactly_at_the_increment() {
        let mut fc = CircuitFlowControl::new();
        for i in 1..=100 {
            let due = fc.on_receive();
            assert_eq!(due, i == 100, "SENDME should fire only on the 100th cell");
        }
        assert_eq!(fc.recv.remaining, 100);
    }

    #[test]
    fn circuit_deliver_window_decrements_independently_of_recv_window() {
        let mut fc = CircuitFlowControl::new();
        fc.on_receive();
        assert_eq!(fc.deliver_window, 999);
    }

    #[test]
    fn stream_flow_control_basic() {
        let mut fc = StreamFlowControl::new(42);
        assert_eq!(fc.stream_id, 42);
        assert_eq!(fc.send_window, 500);
        assert!(fc.can_send());
        assert!(!fc.is_blocked());
        for _ in 0..10 {
            fc.on_send().unwrap();
        }
        assert_eq!(fc.send_window, 490);
        fc.on_sendme_received();
        assert_eq!(fc.send_window, 540);
    }

    #[test]
    fn stream_flow_control_blocking() {
        let mut fc = StreamFlowControl::new(1);
        for _ in 0..500 {
            assert!(!fc.is_blocked());
            fc.on_send().unwrap();
        }
        assert!(fc.is_blocked());
        assert!(fc.on_send().is_err());
        fc.on_sendme_received();
        assert!(!fc.is_blocked());
        assert_eq!(fc.send_window, 50);
    }

    #[test]
    fn stream_flow_control_receive_fires_sendme_exactly_at_the_increment() {
        let mut fc = StreamFlowControl::new(1);
        for i in 1..=50 {
            let due = fc.on_receive_data();
            assert_eq!(due, i == 50);
        }
        assert_eq!(fc.recv.remaining, 50);
    }

    #[test]
    fn interleaved_send_and_receive_windows_stay_independent() {
        let mut fc = StreamFlowControl::new(1);
        for _ in 0..250 {
            fc.on_send().unwrap();
        }
        assert_eq!(fc.send_window, 250);
        for _ in 0..25 {
            assert!(!fc.on_receive_data());
        }
        for i in 0..25 {
            assert_eq!(fc.on_receive_data(), i == 24);
        }
        assert_eq!(fc.send_window, 250);
        assert!(!fc.is_blocked());
    }

    #[test]
    fn flow_control_violation_names_the_stream_id() {
        let mut fc = StreamFlowControl::new(7);
        for _ in 0..500 {
            fc.on_send().unwrap();
        }
        let err = fc.on_send().unwrap_err();
        match err {
            TorError::FlowControlViolation(msg) => assert!(msg.contains('7')),
            other => panic!("expected FlowControlViolation, got {other:?}"),
        }
    }
}
