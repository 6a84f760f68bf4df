// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task signal state and the delivery state machine
//! OWNERS: @kernel-sched-team
//! PUBLIC API: SignalFlags, SignalAction, SignalState (raise/set_action/set_mask/next_delivery/
//!             enter_handler/sigreturn), Delivery, Disposition, SignalError
//! DEPENDS_ON: trap::TrapContext
//! INVARIANTS: SIGKILL/SIGSTOP can never be blocked, caught or ignored;
//!             at most one user handler runs at a time (the in-flight slot);
//!             pending signals are delivered lowest number first

use bitflags::bitflags;
use core::fmt;

use crate::trap::TrapContext;

/// Highest valid signal number.
pub const MAX_SIG: usize = 31;

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGILL: usize = 4;
pub const SIGTRAP: usize = 5;
pub const SIGABRT: usize = 6;
pub const SIGBUS: usize = 7;
pub const SIGKILL: usize = 9;
pub const SIGUSR1: usize = 10;
pub const SIGSEGV: usize = 11;
pub const SIGUSR2: usize = 12;
pub const SIGPIPE: usize = 13;
pub const SIGTERM: usize = 15;
pub const SIGCHLD: usize = 17;
pub const SIGCONT: usize = 18;
pub const SIGSTOP: usize = 19;
pub const SIGTSTP: usize = 20;

/// Default action.
pub const SIG_DFL: usize = 0;
/// Ignore the signal.
pub const SIG_IGN: usize = 1;

bitflags! {
    /// Set of signals; signal `n` is bit `n`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        const SIGHUP    = 1 << 1;
        const SIGINT    = 1 << 2;
        const SIGQUIT   = 1 << 3;
        const SIGILL    = 1 << 4;
        const SIGTRAP   = 1 << 5;
        const SIGABRT   = 1 << 6;
        const SIGBUS    = 1 << 7;
        const SIGFPE    = 1 << 8;
        const SIGKILL   = 1 << 9;
        const SIGUSR1   = 1 << 10;
        const SIGSEGV   = 1 << 11;
        const SIGUSR2   = 1 << 12;
        const SIGPIPE   = 1 << 13;
        const SIGALRM   = 1 << 14;
        const SIGTERM   = 1 << 15;
        const SIGSTKFLT = 1 << 16;
        const SIGCHLD   = 1 << 17;
        const SIGCONT   = 1 << 18;
        const SIGSTOP   = 1 << 19;
        const SIGTSTP   = 1 << 20;
        const SIGTTIN   = 1 << 21;
        const SIGTTOU   = 1 << 22;
        const SIGURG    = 1 << 23;
        const SIGXCPU   = 1 << 24;
        const SIGXFSZ   = 1 << 25;
        const SIGVTALRM = 1 << 26;
        const SIGPROF   = 1 << 27;
        const SIGWINCH  = 1 << 28;
        const SIGIO     = 1 << 29;
        const SIGPWR    = 1 << 30;
        const SIGSYS    = 1 << 31;
    }
}

impl SignalFlags {
    /// Signals that can be neither blocked nor caught.
    pub const UNCATCHABLE: Self = Self::SIGKILL.union(Self::SIGSTOP);

    pub fn from_signum(signum: usize) -> Option<Self> {
        if (1..=MAX_SIG).contains(&signum) {
            Some(Self::from_bits_retain(1 << signum))
        } else {
            None
        }
    }

    /// Lowest signal number in the set.
    pub fn lowest(self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.bits().trailing_zeros() as usize)
        }
    }

    fn signums(self) -> impl Iterator<Item = usize> {
        (1..=MAX_SIG).filter(move |&n| self.bits() & (1 << n) != 0)
    }
}

/// What happens to a signal whose action is `SIG_DFL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Terminate,
    Stop,
    Continue,
}

pub fn default_disposition(signum: usize) -> Disposition {
    let Some(sig) = SignalFlags::from_signum(signum) else {
        return Disposition::Ignore;
    };
    if sig.intersects(SignalFlags::SIGCHLD | SignalFlags::SIGURG | SignalFlags::SIGWINCH) {
        Disposition::Ignore
    } else if sig == SignalFlags::SIGCONT {
        Disposition::Continue
    } else if sig.intersects(SignalFlags::SIGSTOP | SignalFlags::SIGTSTP | SignalFlags::SIGTTIN | SignalFlags::SIGTTOU) {
        Disposition::Stop
    } else {
        Disposition::Terminate
    }
}

/// User-visible action record: handler address plus extra signals to block while it runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalAction {
    pub handler: usize,
    pub mask: SignalFlags,
}

impl SignalAction {
    /// Size of the user ABI record (`usize` handler, `u32` mask, padding).
    pub const USER_SIZE: usize = 16;

    pub fn to_user_bytes(self) -> [u8; Self::USER_SIZE] {
        let mut out = [0u8; Self::USER_SIZE];
        out[..8].copy_from_slice(&(self.handler as u64).to_le_bytes());
        out[8..12].copy_from_slice(&self.mask.bits().to_le_bytes());
        out
    }

    pub fn from_user_bytes(raw: &[u8; Self::USER_SIZE]) -> Self {
        let mut handler = [0u8; 8];
        handler.copy_from_slice(&raw[..8]);
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&raw[8..12]);
        Self {
            handler: u64::from_le_bytes(handler) as usize,
            mask: SignalFlags::from_bits_retain(u32::from_le_bytes(mask)),
        }
    }

    fn is_user_handler(&self) -> bool {
        self.handler != SIG_DFL && self.handler != SIG_IGN
    }
}

/// Snapshot taken when a user handler is entered; restored by `sigreturn`.
#[derive(Clone, Copy, Debug)]
pub struct InFlight {
    pub signum: usize,
    pub saved: TrapContext,
    pub saved_mask: SignalFlags,
}

#[must_use = "signal errors must be reported to the caller"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalError {
    /// Signal number outside 1..=31.
    InvalidSignal,
    /// SIGKILL or SIGSTOP cannot be caught or ignored.
    Uncatchable,
    /// `sigreturn` without a handler in flight.
    NothingInFlight,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignal => f.write_str("invalid signal number"),
            Self::Uncatchable => f.write_str("signal cannot be caught"),
            Self::NothingInFlight => f.write_str("no signal handler in flight"),
        }
    }
}

/// Next step the kernel must take for a task before it may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing to deliver; resume normally.
    None,
    /// Enter a user handler for `signum`.
    Handler { signum: usize, action: SignalAction },
    /// Default action kills the task with this exit code.
    Terminate(i32),
    /// The task is stopped.
    Frozen,
}

#[derive(Clone, Debug, Default)]
pub struct SignalState {
    pending: SignalFlags,
    mask: SignalFlags,
    actions: [SignalAction; MAX_SIG + 1],
    in_flight: Option<InFlight>,
    frozen: bool,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State a forked child starts with: same mask, actions and in-flight snapshot, nothing pending.
    pub fn fork_copy(&self) -> Self {
        Self { pending: SignalFlags::empty(), frozen: false, ..self.clone() }
    }

    /// State kept across `exec`: any in-flight handler is abandoned and its saved mask restored.
    pub fn reset_for_exec(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.mask = in_flight.saved_mask;
        }
    }

    pub fn pending(&self) -> SignalFlags {
        self.pending
    }

    pub fn mask(&self) -> SignalFlags {
        self.mask
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn action(&self, signum: usize) -> Result<SignalAction, SignalError> {
        SignalFlags::from_signum(signum).ok_or(SignalError::InvalidSignal)?;
        Ok(self.actions[signum])
    }

    /// Marks `signum` pending. Raising an already pending signal has no further effect.
    pub fn raise(&mut self, signum: usize) -> Result<(), SignalError> {
        let sig = SignalFlags::from_signum(signum).ok_or(SignalError::InvalidSignal)?;
        self.pending |= sig;
        Ok(())
    }

    /// Installs `action` for `signum` and returns the previous one.
    pub fn set_action(&mut self, signum: usize, action: SignalAction) -> Result<SignalAction, SignalError> {
        let sig = SignalFlags::from_signum(signum).ok_or(SignalError::InvalidSignal)?;
        if sig.intersects(SignalFlags::UNCATCHABLE) {
            return Err(SignalError::Uncatchable);
        }
        let sanitized = SignalAction { handler: action.handler, mask: action.mask - SignalFlags::UNCATCHABLE };
        Ok(core::mem::replace(&mut self.actions[signum], sanitized))
    }

    /// Replaces the blocked set and returns the previous one.
    pub fn set_mask(&mut self, mask: SignalFlags) -> SignalFlags {
        core::mem::replace(&mut self.mask, mask - SignalFlags::UNCATCHABLE)
    }

    /// True if raising `signum` now would run a user handler rather than the default action.
    pub fn would_catch(&self, signum: usize) -> bool {
        let Some(sig) = SignalFlags::from_signum(signum) else {
            return false;
        };
        self.in_flight.is_none() && !self.mask.intersects(sig) && self.actions[signum].is_user_handler()
    }

    /// Consumes pending signals until one needs the kernel's attention.
    ///
    /// Default actions that ignore, stop or continue are applied here. A signal with a
    /// user handler stays pending while another handler is in flight.
    pub fn next_delivery(&mut self) -> Delivery {
        loop {
            if self.frozen {
                if self.pending.contains(SignalFlags::SIGKILL) {
                    self.pending.remove(SignalFlags::SIGKILL);
                    return Delivery::Terminate(-(SIGKILL as i32));
                }
                if !self.pending.contains(SignalFlags::SIGCONT) {
                    return Delivery::Frozen;
                }
                self.frozen = false;
                if !self.actions[SIGCONT].is_user_handler() {
                    self.pending.remove(SignalFlags::SIGCONT);
                }
            }

            let deliverable = self.pending - (self.mask - SignalFlags::UNCATCHABLE);
            let next = deliverable
                .signums()
                .find(|&n| self.in_flight.is_none() || !self.actions[n].is_user_handler());
            let Some(signum) = next else {
                return Delivery::None;
            };
            let action = self.actions[signum];
            if let Some(sig) = SignalFlags::from_signum(signum) {
                self.pending.remove(sig);
            }
            match action.handler {
                SIG_IGN => {}
                SIG_DFL => match default_disposition(signum) {
                    Disposition::Ignore | Disposition::Continue => {}
                    Disposition::Stop => self.frozen = true,
                    Disposition::Terminate => return Delivery::Terminate(-(signum as i32)),
                },
                _ => return Delivery::Handler { signum, action },
            }
        }
    }

    /// Redirects `cx` into the handler and records what `sigreturn` must restore.
    ///
    /// The handler gets the signal number in `a0`; every other register keeps
    /// its interrupted value. The saved context stays in the kernel.
    pub fn enter_handler(&mut self, cx: &mut TrapContext, signum: usize, action: SignalAction) {
        let sig = SignalFlags::from_signum(signum).unwrap_or_default();
        self.in_flight = Some(InFlight { signum, saved: *cx, saved_mask: self.mask });
        self.mask |= (sig | action.mask) - SignalFlags::UNCATCHABLE;
        cx.sepc = action.handler;
        cx.x[10] = signum;
    }

    /// Restores the context and mask saved on handler entry; returns the restored `a0`.
    pub fn sigreturn(&mut self, cx: &mut TrapContext) -> Result<usize, SignalError> {
        let in_flight = self.in_flight.take().ok_or(SignalError::NothingInFlight)?;
        *cx = in_flight.saved;
        self.mask = in_flight.saved_mask;
        Ok(cx.x[10])
    }
}
