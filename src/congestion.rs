//! Coarse per-connection congestion window: slow start below a threshold,
//! additive increase above it, multiplicative decrease on loss.
//!
//! The window is a throttle signal for how much unacknowledged reliable
//! traffic a connection should have outstanding. It is advisory - the send
//! path does not hard-block on it - which is all the fairness this protocol
//! aims for.

const INITIAL_WINDOW: u32 = 1;
const INITIAL_SSTHRESH: u32 = 64;
const MIN_SSTHRESH: u32 = 2;

#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: u32,
    ssthresh: u32,
    /// ACKs accumulated towards the next additive increment; once a full
    /// window's worth of ACKs has arrived, the window grows by one.
    ack_credit: u32,
    max_window: u32,
}

impl CongestionController {
    pub fn new(max_window: u32) -> CongestionController {
        CongestionController {
            cwnd: INITIAL_WINDOW,
            ssthresh: INITIAL_SSTHRESH.min(max_window),
            ack_credit: 0,
            max_window,
        }
    }

    pub fn window(&self) -> u32 {
        self.cwnd
    }

    pub fn on_ack(&mut self) {
        if self.cwnd >= self.max_window {
            return;
        }

        if self.cwnd < self.ssthresh {
            // slow start: one increment per ACK
            self.cwnd += 1;
        } else {
            self.ack_credit += 1;
            if self.ack_credit >= self.cwnd {
                self.ack_credit -= self.cwnd;
                self.cwnd += 1;
            }
        }

        self.cwnd = self.cwnd.min(self.max_window);
    }

    /// A reliable frame exhausted its retry budget: treat as a timeout loss.
    pub fn on_loss(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(MIN_SSTHRESH);
        self.cwnd = INITIAL_WINDOW;
        self.ack_credit = 0;
    }
}
