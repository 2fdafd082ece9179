//! In-process backend for trivial and test functions: resolves immediately
//! with a success result wrapping the input.

use nimbus_common::InvocationResult;

use crate::dispatch::DispatchOutcome;
use crate::task::InvocationTask;

#[derive(Default)]
pub struct LocalDispatcher;

impl LocalDispatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn dispatch(&self, task: &InvocationTask) -> DispatchOutcome {
        DispatchOutcome::Completed(InvocationResult::success(Some(task.request.input.clone())))
    }
}
