// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::{type_name, Any};
use std::panic::{self, AssertUnwindSafe};

use crate::job_engine::job::JobFailure;

/// Opaque per-job data. The callback mutates it in place and it stays on the
/// job afterwards as the job's output.
pub type Payload = Box<dyn Any + Send>;

type Callback = Box<dyn FnOnce(&mut (dyn Any + Send)) -> anyhow::Result<()> + Send + 'static>;

/// The work of a job: a one-shot callback with its payload type erased.
pub struct ClosureJob {
    callback: Callback,
}

impl ClosureJob {
    pub fn new<P, F>(f: F) -> Self
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            callback: Box::new(move |payload: &mut (dyn Any + Send)| {
                let payload = payload
                    .downcast_mut::<P>()
                    .ok_or_else(|| anyhow::anyhow!("payload is not a {}", type_name::<P>()))?;
                f(payload)
            }),
        }
    }

    /// Runs the callback on the calling thread. Errors and panics are turned
    /// into a [`JobFailure`]; nothing escapes to the caller.
    pub fn run(self, payload: &mut (dyn Any + Send)) -> Result<(), JobFailure> {
        let callback = self.callback;
        match panic::catch_unwind(AssertUnwindSafe(move || callback(payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobFailure::Error(format!("{err:#}"))),
            Err(panic) => Err(JobFailure::Panic(panic_message(panic.as_ref()))),
        }
    }
}

impl std::fmt::Debug for ClosureJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureJob").finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
