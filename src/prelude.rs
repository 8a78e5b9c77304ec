pub use crate::error::{AggregateException, PanicError, PromiseError, RejectReason};
pub use crate::config::{UncaughtRejectionHandler,
                        foreground_context,
                        set_foreground_context,
                        set_uncaught_rejection_handler,
                        uncaught_rejection_handler};
pub use crate::cancel::{CancelationRegistration, CancelationSource, CancelationToken};
pub use crate::rt::{CompletionBehavior,
                    ContinuationContext,
                    ContinuationOptions,
                    ScheduleContext,
                    current_context,
                    bind_current_context,
                    run_deferred,
                    serial_local_thread::{LocalContext, LocalContextRunner},
                    serial_single_thread::{SingleContext, SingleContextRunner}};
pub use crate::promise::{Deferred, Promise, PromiseFuture, PromiseResult, PromiseState, Retainer};
pub use crate::combinator::*;
