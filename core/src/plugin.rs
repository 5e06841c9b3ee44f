//! Plugin pipeline composition.
//!
//! A pipeline is an ordered chain of [`Middleware`] wrapped around a terminal
//! sink. The first plugin in the list is the outermost wrapper: it sees every
//! operation first and decides whether to pass it on through [`Next::run`].
//! The last plugin's `next` is the sink.
//!
//! Each plugin receives a [`PluginContext`] during `init`:
//! - an [`Emitter`] that pushes a *new* operation into the head of the
//!   composed pipeline (only valid once composition is finished)
//! - a read-only [`CacheView`]
//!
//! Operations are processed one at a time. An operation dispatched while
//! another one is running, from a middleware, a listener or another thread,
//! is queued and runs once the current one has reached the sink. The thread
//! that found the pipeline idle drains the queue.
//!
//! # Examples
//!
//! ```
//! use fetchline_core::plugin::{Middleware, Next, Pipeline, Plugin, plugin_fn};
//! use fetchline_core::{EmptyCache, Operation, Request, RequestId};
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let log = Arc::clone(&seen);
//!
//! let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(plugin_fn("log", move |_ctx| {
//!     let log = Arc::clone(&log);
//!     Ok(Box::new(move |op: Operation, next: &Next| {
//!         log.lock().unwrap().push(op.kind().as_str());
//!         next.run(op);
//!     }) as Box<dyn Middleware>)
//! }))];
//!
//! let pipeline = Pipeline::compose(plugins, Arc::new(EmptyCache), |_op| {}).unwrap();
//! pipeline.dispatch(Operation::fetch(Request::from_id(RequestId::new("a"))));
//!
//! assert_eq!(*seen.lock().unwrap(), vec!["fetch"]);
//! ```

use crate::cache::CacheView;
use crate::error::PipelineError;
use crate::operation::Operation;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

type Dispatch = Arc<dyn Fn(Operation) + Send + Sync>;
type WeakDispatch = Weak<dyn Fn(Operation) + Send + Sync>;
type Job = Box<dyn FnOnce() + Send>;

/// Handle to the rest of the chain below a middleware.
#[derive(Clone)]
pub struct Next(Dispatch);

impl Next {
    /// Forward an operation downstream.
    pub fn run(&self, op: Operation) {
        (self.0)(op);
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next(<dispatch>)")
    }
}

/// A pipeline stage.
pub trait Middleware: Send + Sync {
    /// Handle one operation. Call `next.run(op)` to pass it on.
    fn call(&self, op: Operation, next: &Next);
}

impl<F> Middleware for F
where
    F: Fn(Operation, &Next) + Send + Sync,
{
    fn call(&self, op: Operation, next: &Next) {
        self(op, next);
    }
}

/// Named middleware factory.
pub trait Plugin: Send + Sync {
    /// Unique, non-empty name.
    fn name(&self) -> &str;

    /// Build the middleware.
    ///
    /// Runs once, before the pipeline is wired. Calling
    /// [`Emitter::emit`] from here is a setup error.
    ///
    /// # Errors
    ///
    /// Implementations may fail with any [`PipelineError`]; composition is
    /// aborted with that error.
    fn init(self: Box<Self>, ctx: PluginContext) -> Result<Box<dyn Middleware>, PipelineError>;
}

/// Capabilities handed to a plugin during `init`.
#[derive(Clone)]
pub struct PluginContext {
    /// Pushes new operations into the head of the pipeline
    pub emit: Emitter,
    /// Read-only access to the request store
    pub cache: CacheView,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("emit", &self.emit)
            .finish_non_exhaustive()
    }
}

/// Shared wiring state between a pipeline and its emitters.
#[derive(Default)]
struct EmitTarget {
    head: OnceLock<WeakDispatch>,
    violated: AtomicBool,
}

/// Pushes operations into the composed pipeline.
///
/// Holds a weak reference: emitting never keeps a dropped pipeline alive.
#[derive(Clone)]
pub struct Emitter {
    plugin: Arc<str>,
    target: Arc<EmitTarget>,
}

impl Emitter {
    /// Dispatch `op` into the head of the pipeline.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Setup`] when called before the pipeline is wired
    ///   (for example from inside `init`)
    /// - [`PipelineError::Detached`] when the pipeline has been dropped
    pub fn emit(&self, op: Operation) -> Result<(), PipelineError> {
        let Some(head) = self.target.head.get() else {
            self.target.violated.store(true, Ordering::SeqCst);
            return Err(PipelineError::Setup {
                plugin: self.plugin.to_string(),
            });
        };

        let head = head.upgrade().ok_or(PipelineError::Detached)?;
        head(op);
        Ok(())
    }

    /// Name of the plugin owning this emitter.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("plugin", &self.plugin)
            .field("wired", &self.target.head.get().is_some())
            .finish()
    }
}

/// FIFO of work waiting for the pipeline.
#[derive(Default)]
struct Serial {
    state: Mutex<SerialState>,
}

#[derive(Default)]
struct SerialState {
    queue: VecDeque<Job>,
    draining: bool,
}

impl Serial {
    fn lock(&self) -> MutexGuard<'_, SerialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job`, then drain the queue unless another call already does.
    fn run(&self, job: Job) {
        {
            let mut state = self.lock();
            state.queue.push_back(job);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let _drain = Drain(self);
        while let Some(job) = self.pop() {
            job();
        }
    }

    fn pop(&self) -> Option<Job> {
        let mut state = self.lock();
        let job = state.queue.pop_front();
        if job.is_none() {
            state.draining = false;
        }
        job
    }
}

/// Hands the queue to the next caller if a job panics.
struct Drain<'a>(&'a Serial);

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

/// A composed pipeline.
pub struct Pipeline {
    head: Dispatch,
    serial: Arc<Serial>,
    names: Vec<String>,
}

impl Pipeline {
    /// Validate, initialise and chain `plugins` around `sink`.
    ///
    /// Validation happens before any `init` runs. Plugins are then
    /// initialised in list order and chained so that the first plugin is
    /// outermost.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::EmptyName`] if a plugin name is empty or blank
    /// - [`PipelineError::DuplicateName`] if two plugins share a name
    /// - [`PipelineError::Setup`] if a plugin emitted during `init`
    /// - any error returned by a plugin's `init`
    pub fn compose<F>(
        plugins: Vec<Box<dyn Plugin>>,
        cache: CacheView,
        sink: F,
    ) -> Result<Self, PipelineError>
    where
        F: Fn(Operation) + Send + Sync + 'static,
    {
        let names = validate(&plugins)?;
        let target = Arc::new(EmitTarget::default());

        let mut stages = Vec::with_capacity(plugins.len());
        for (plugin, name) in plugins.into_iter().zip(&names) {
            let ctx = PluginContext {
                emit: Emitter {
                    plugin: Arc::from(name.as_str()),
                    target: Arc::clone(&target),
                },
                cache: Arc::clone(&cache),
            };

            let stage = plugin.init(ctx)?;
            if target.violated.swap(false, Ordering::SeqCst) {
                return Err(PipelineError::Setup {
                    plugin: name.clone(),
                });
            }
            stages.push(stage);
        }

        let mut chain: Dispatch = Arc::new(sink);
        for stage in stages.into_iter().rev() {
            let next = Next(chain);
            chain = Arc::new(move |op: Operation| stage.call(op, &next));
        }

        let serial = Arc::new(Serial::default());
        let head: Dispatch = {
            let serial = Arc::clone(&serial);
            Arc::new(move |op: Operation| {
                let chain = Arc::clone(&chain);
                serial.run(Box::new(move || chain(op)));
            })
        };

        // Freshly created, so the cell is always empty here.
        let _ = target.head.set(Arc::downgrade(&head));

        tracing::debug!(plugins = ?names, "Pipeline composed");
        Ok(Self {
            head,
            serial,
            names,
        })
    }

    /// Run an operation through the pipeline.
    ///
    /// Returns once the operation has been processed, unless the pipeline is
    /// busy: the operation is then queued behind the running one.
    pub fn dispatch(&self, op: Operation) {
        (self.head)(op);
    }

    /// Run `job` in turn with dispatched operations.
    ///
    /// The job sees every operation dispatched before it fully processed and
    /// none dispatched after it. Operations the job dispatches run after it.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.serial.run(Box::new(job));
    }

    /// Plugin names in pipeline order.
    #[must_use]
    pub fn plugin_names(&self) -> &[String] {
        &self.names
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("plugins", &self.names)
            .finish_non_exhaustive()
    }
}

fn validate(plugins: &[Box<dyn Plugin>]) -> Result<Vec<String>, PipelineError> {
    let mut seen = HashSet::with_capacity(plugins.len());
    let mut names = Vec::with_capacity(plugins.len());

    for (index, plugin) in plugins.iter().enumerate() {
        let name = plugin.name();
        if name.trim().is_empty() {
            return Err(PipelineError::EmptyName { index });
        }
        if !seen.insert(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        names.push(name.to_string());
    }

    Ok(names)
}

/// A plugin built from a name and an `init` closure.
pub struct FnPlugin<F> {
    name: String,
    init: F,
}

/// Build a [`Plugin`] from a closure.
pub fn plugin_fn<F>(name: impl Into<String>, init: F) -> FnPlugin<F>
where
    F: FnOnce(PluginContext) -> Result<Box<dyn Middleware>, PipelineError> + Send + Sync,
{
    FnPlugin {
        name: name.into(),
        init,
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: FnOnce(PluginContext) -> Result<Box<dyn Middleware>, PipelineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn init(self: Box<Self>, ctx: PluginContext) -> Result<Box<dyn Middleware>, PipelineError> {
        (self.init)(ctx)
    }
}
