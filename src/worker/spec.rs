//! Declarative worker descriptor.
//!
//! A [`WorkerSpec`] says what a pool runs: how many replicas, which body,
//! which fixed arguments, and which channels the body reads and writes.
//! Building one only validates; no channel is touched.

use crate::channel::BoundedChannel;
use crate::control::ControlSignal;
use crate::error::{ProcflowError, Result};
use crate::logging::WorkerLogging;
use std::sync::Arc;
use tracing::error;

/// The long-running function every replica executes.
///
/// Receives the fixed arguments, the declared input channels (in order), the
/// declared output channels (in order) and the control signal. A body is
/// expected to loop until exit is requested or an input reports
/// end-of-stream; see [`run_until_exit`](crate::worker::run_until_exit).
pub type WorkerBody<A, I, O> =
    Arc<dyn Fn(&A, &[BoundedChannel<I>], &[BoundedChannel<O>], &ControlSignal) + Send + Sync>;

/// Immutable, validated description of one worker type.
pub struct WorkerSpec<A, I, O> {
    name: String,
    count: usize,
    body: WorkerBody<A, I, O>,
    args: A,
    inputs: Vec<BoundedChannel<I>>,
    outputs: Vec<BoundedChannel<O>>,
    control: ControlSignal,
    logging: WorkerLogging,
}

impl<A, I, O> WorkerSpec<A, I, O> {
    /// Validate and assemble a spec.
    ///
    /// Fails when `count` is zero, the body is missing or the name is empty.
    /// The reason is logged and returned; the caller decides whether the
    /// run aborts.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: impl Into<String>,
        count: usize,
        body: Option<WorkerBody<A, I, O>>,
        args: A,
        inputs: Vec<BoundedChannel<I>>,
        outputs: Vec<BoundedChannel<O>>,
        control: &ControlSignal,
        logging: WorkerLogging,
    ) -> Result<Self> {
        let name = name.into();
        let reject = |reason: String| {
            error!(worker = %name, reason = %reason, "Rejected worker spec");
            Err(ProcflowError::InvalidSpec(reason))
        };

        if name.trim().is_empty() {
            return reject("worker name must not be empty".to_string());
        }
        if count < 1 {
            return reject(format!("{}: replica count must be at least 1, got {}", name, count));
        }
        let Some(body) = body else {
            return reject(format!("{}: worker body is not set", name));
        };

        Ok(Self {
            name,
            count,
            body,
            args,
            inputs,
            outputs,
            control: control.clone(),
            logging,
        })
    }

    /// Start a builder; `count` defaults to 1 and both channel lists to empty.
    pub fn builder(name: impl Into<String>, args: A) -> WorkerSpecBuilder<A, I, O> {
        WorkerSpecBuilder {
            name: name.into(),
            count: 1,
            body: None,
            args,
            inputs: Vec::new(),
            outputs: Vec::new(),
            control: None,
            logging: WorkerLogging::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn body(&self) -> &WorkerBody<A, I, O> {
        &self.body
    }

    pub fn args(&self) -> &A {
        &self.args
    }

    pub fn inputs(&self) -> &[BoundedChannel<I>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[BoundedChannel<O>] {
        &self.outputs
    }

    pub fn control(&self) -> &ControlSignal {
        &self.control
    }

    pub fn logging(&self) -> &WorkerLogging {
        &self.logging
    }
}

impl<A, I, O> std::fmt::Debug for WorkerSpec<A, I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("logging", &self.logging)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkerSpec`].
pub struct WorkerSpecBuilder<A, I, O> {
    name: String,
    count: usize,
    body: Option<WorkerBody<A, I, O>>,
    args: A,
    inputs: Vec<BoundedChannel<I>>,
    outputs: Vec<BoundedChannel<O>>,
    control: Option<ControlSignal>,
    logging: WorkerLogging,
}

impl<A, I, O> WorkerSpecBuilder<A, I, O> {
    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn body<F>(mut self, body: F) -> Self
    where
        F: Fn(&A, &[BoundedChannel<I>], &[BoundedChannel<O>], &ControlSignal)
            + Send
            + Sync
            + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }

    pub fn input(mut self, channel: BoundedChannel<I>) -> Self {
        self.inputs.push(channel);
        self
    }

    pub fn output(mut self, channel: BoundedChannel<O>) -> Self {
        self.outputs.push(channel);
        self
    }

    pub fn control(mut self, control: &ControlSignal) -> Self {
        self.control = Some(control.clone());
        self
    }

    pub fn logging(mut self, logging: WorkerLogging) -> Self {
        self.logging = logging;
        self
    }

    /// Validate into a [`WorkerSpec`]. A missing control signal is rejected
    /// like a missing body.
    pub fn build(self) -> Result<WorkerSpec<A, I, O>> {
        let Some(control) = self.control else {
            error!(worker = %self.name, "Rejected worker spec: no control signal");
            return Err(ProcflowError::InvalidSpec(format!(
                "{}: control signal is not set",
                self.name
            )));
        };
        WorkerSpec::create(
            self.name,
            self.count,
            self.body,
            self.args,
            self.inputs,
            self.outputs,
            &control,
            self.logging,
        )
    }
}
