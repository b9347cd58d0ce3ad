//! Where diagnostics go.
//!
//! Sinks are called with the allocator lock held and the calling thread marked
//! nested, so anything they allocate goes straight to the real allocator.
//! They still must not take locks that another thread might hold while
//! allocating, which is why the default sink writes to fd 2 by hand.

use std::fmt;

use crate::util::print::eprint_line;

pub trait DiagnosticSink {
    /// Per-call trace lines, only sent when tracing is enabled
    fn trace(&self, args: fmt::Arguments<'_>);
    /// Refused requests and configuration problems
    fn report(&self, args: fmt::Arguments<'_>);
    /// The last thing said before the process ends
    fn fatal(&self, args: fmt::Arguments<'_>);
}

impl<K> DiagnosticSink for &K
where
    K: DiagnosticSink + ?Sized,
{
    fn trace(&self, args: fmt::Arguments<'_>) {
        (**self).trace(args)
    }

    fn report(&self, args: fmt::Arguments<'_>) {
        (**self).report(args)
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        (**self).fatal(args)
    }
}

/// Plain lines on standard error, formatted on the stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn trace(&self, args: fmt::Arguments<'_>) {
        eprint_line(args)
    }

    fn report(&self, args: fmt::Arguments<'_>) {
        eprint_line(format_args!("heaptrap: {args}"))
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        eprint_line(format_args!("heaptrap: {args}"))
    }
}

/// Hands everything to the `log` facade, for programs that already set up a
/// logger (e.g. `env_logger`) and want heaptrap's lines mixed in with theirs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn trace(&self, args: fmt::Arguments<'_>) {
        log::trace!(target: "heaptrap", "{args}");
    }

    fn report(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: "heaptrap", "{args}");
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        log::error!(target: "heaptrap", "{args}");
    }
}
