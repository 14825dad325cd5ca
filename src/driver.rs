//! Test driver
//!
//! [`TestCase::run_test`] runs one test body on a fresh [`EventLoop`] and turns
//! every way it can go wrong into a [`TestFailure`]:
//!
//! 1. the body settles the [`CompletionSignal`] once its result is in,
//! 2. an armed timeout settles it with [`TestFailure::TimeoutExceeded`],
//! 3. the [`LoopErrorSentinel`] settles it with errors escaping the loop.
//!
//! The first settlement wins and stops the loop. Fixtures run their hooks as
//! separate stages on the same loop, each called once the previous one has
//! settled. Afterwards the driver cancels the timeout, checks the minimum
//! runtime, leftover watchers and callback stubs, and drops the loop together
//! with everything still registered on it.

use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Handle, Sleep};
use crate::failure::TestFailure;
use crate::leak::{check_leaks, WatcherPolicy};
use crate::outcome::TestOutcome;
use crate::sentinel::{LoopErrorSentinel, SentinelSwitch};
use crate::signal::{CompletionReceiver, CompletionSignal};
use crate::stub::{CallbackStub, Expectation};
use crate::thrown::{greater_or_equal, sanitize_type_name, Thrown};
use crate::timeout::TimeoutGuard;
use crate::timing::round_millis;
use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Base of every async test.
///
/// ```
/// use loop_test::{TestCase, TestFailure};
/// use std::time::Duration;
///
/// let mut case = TestCase::new("sleeps_briefly");
/// let value = case
///     .run_test(|ctx| async move {
///         ctx.sleep(Duration::from_millis(5)).await;
///         Ok(42)
///     })
///     .unwrap();
/// assert_eq!(value, 42);
///
/// let failure = TestCase::new("times_out")
///     .run_test(|ctx| async move {
///         ctx.set_timeout(Duration::from_millis(10));
///         ctx.sleep(Duration::from_millis(200)).await;
///         Ok(())
///     })
///     .unwrap_err();
/// assert!(matches!(failure, TestFailure::TimeoutExceeded { .. }));
/// ```
#[derive(Debug, Clone)]
pub struct TestCase {
    name: String,
    config: HarnessConfig,
    set_up_invoked: bool,
}

impl TestCase {
    /// Test case configured from the environment
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, HarnessConfig::from_env())
    }

    /// Test case with an explicit configuration
    pub fn with_config(name: impl Into<String>, config: HarnessConfig) -> Self {
        Self {
            name: name.into(),
            config,
            set_up_invoked: false,
        }
    }

    /// Name reported in failures
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration used for each run
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Prepare the case for running. Fixtures overriding
    /// [`AsyncFixture::set_up`] must call this.
    pub fn set_up(&mut self) {
        log::trace!("Setting up test '{}'", self.name);
        self.set_up_invoked = true;
    }

    /// Run an async body to completion
    pub fn run_test<T, F, Fut>(&mut self, body: F) -> std::result::Result<T, TestFailure>
    where
        T: 'static,
        F: FnOnce(TestContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, Thrown>> + 'static,
    {
        self.run_outcome(|ctx| TestOutcome::deferred(body(ctx)))
    }

    /// Run an async body with data-provider arguments
    pub fn run_test_with<A, T, F, Fut>(&mut self, args: A, body: F) -> std::result::Result<T, TestFailure>
    where
        T: 'static,
        F: FnOnce(TestContext, A) -> Fut,
        Fut: Future<Output = std::result::Result<T, Thrown>> + 'static,
    {
        self.run_outcome(|ctx| TestOutcome::deferred(body(ctx, args)))
    }

    /// Run a body that reports its own [`TestOutcome`]
    pub fn run_outcome<T, F>(&mut self, body: F) -> std::result::Result<T, TestFailure>
    where
        T: 'static,
        F: FnOnce(TestContext) -> TestOutcome<T>,
    {
        self.set_up();
        let mut run = self.begin(type_name::<Self>())?;
        let result = run
            .stage(true, body)
            .and_then(|settled| settled.map_err(TestFailure::from_body));
        run.finish(result)
    }

    /// Run `body` against `fixture`, with its lifecycle hooks around it
    pub fn run_fixture<X, T, F, Fut>(fixture: &mut X, body: F) -> std::result::Result<T, TestFailure>
    where
        X: AsyncFixture,
        T: 'static,
        F: FnOnce(&mut X, TestContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, Thrown>> + 'static,
    {
        fixture.set_up();
        let mut run = fixture.test_case().begin(type_name::<X>())?;
        let result = run_fixture_stages(&mut run, fixture, body);
        run.finish(result)
    }

    /// Start a run; consumes the set-up flag so every run needs a fresh [`TestCase::set_up`]
    fn begin(&mut self, fixture: &str) -> std::result::Result<TestRun, TestFailure> {
        if !std::mem::take(&mut self.set_up_invoked) {
            return Err(TestFailure::SetupContractViolation {
                fixture: sanitize_type_name(fixture).into_owned(),
            });
        }

        log::debug!("Running test '{}'", self.name);

        let event_loop = EventLoop::new();
        let handle = event_loop.handle().clone();
        let (signal, receiver) = CompletionSignal::new();
        let sentinel = LoopErrorSentinel::install(&handle, signal.clone());
        let ctx = TestContext::new(self, handle.clone(), signal.clone(), sentinel.switch());

        if let Some(limit) = self.config.default_timeout {
            ctx.set_timeout(limit);
        }

        Ok(TestRun {
            name: self.name.clone(),
            trace_watchers: self.config.trace_watchers,
            sentinel,
            ctx,
            event_loop,
            handle,
            signal,
            receiver,
            start: Instant::now(),
        })
    }
}

fn run_fixture_stages<X, T, F, Fut>(run: &mut TestRun, fixture: &mut X, body: F) -> std::result::Result<T, TestFailure>
where
    X: AsyncFixture,
    T: 'static,
    F: FnOnce(&mut X, TestContext) -> Fut,
    Fut: Future<Output = std::result::Result<T, Thrown>> + 'static,
{
    run.stage(false, |ctx| fixture.set_up_async(&ctx))?
        .map_err(TestFailure::from_body)?;

    let result = run.stage(false, |ctx| TestOutcome::deferred(body(fixture, ctx)))?;
    let torn_down = run.stage(true, |ctx| fixture.tear_down_async(&ctx))?;

    let value = result.map_err(TestFailure::from_body)?;
    torn_down.map_err(TestFailure::from_body)?;
    Ok(value)
}

/// One test on its own loop, driven stage by stage
struct TestRun {
    name: String,
    trace_watchers: bool,
    sentinel: LoopErrorSentinel,
    ctx: TestContext,
    event_loop: EventLoop,
    handle: Handle,
    signal: CompletionSignal,
    receiver: CompletionReceiver,
    start: Instant,
}

impl TestRun {
    /// Run the loop until the stage built by `stage` settles.
    ///
    /// `Err` means the whole test is over: the timeout fired, an error escaped
    /// to the loop, or the loop idled out first. The final stage settles the
    /// completion signal so later loop errors are dropped.
    fn stage<T, F>(
        &mut self,
        settles: bool,
        stage: F,
    ) -> std::result::Result<std::result::Result<T, Thrown>, TestFailure>
    where
        T: 'static,
        F: FnOnce(TestContext) -> TestOutcome<T>,
    {
        let ctx = self.ctx.clone();
        let outcome = match catch_unwind(AssertUnwindSafe(|| stage(ctx))) {
            Ok(outcome) => outcome,
            Err(payload) => TestOutcome::Failed(Thrown::from_panic(payload)),
        };
        let future = outcome.normalize();
        let slot: Rc<RefCell<Option<std::result::Result<T, Thrown>>>> = Rc::new(RefCell::new(None));

        {
            let slot = Rc::clone(&slot);
            let signal = self.signal.clone();
            let handle = self.handle.clone();
            self.handle.spawn(async move {
                let result = future.await;
                *slot.borrow_mut() = Some(result);
                if !settles || signal.settle(Ok(())) {
                    handle.stop();
                }
            });
        }

        if let Err(e) = self.handle.run() {
            log::warn!("Event loop of test '{}' failed: {}", self.name, e);
        }

        if let Some(Err(failure)) = self.receiver.take() {
            return Err(failure);
        }
        let settled = slot.borrow_mut().take();
        settled.ok_or(TestFailure::LoopStopped)
    }

    /// Post-run checks, then tear the loop down
    fn finish<T>(self, result: std::result::Result<T, TestFailure>) -> std::result::Result<T, TestFailure> {
        self.ctx.cancel_timeout();
        let elapsed = self.start.elapsed();

        let result = result.and_then(|value| self.ctx.check_runtime(elapsed).map(|()| value));

        // leftovers are always inspected, but only reported for passing tests
        let leaks = check_leaks(&self.handle, &self.name, self.ctx.watcher_policy(), self.trace_watchers);
        let result = match (result, leaks) {
            (Ok(value), leaks) => leaks.map(|()| value),
            (Err(failure), Err(leaks)) => {
                log::debug!("Ignoring leak check of failed test: {}", leaks);
                Err(failure)
            }
            (Err(failure), Ok(())) => Err(failure),
        };

        let result = result.and_then(|value| self.ctx.verify_callbacks().map(|()| value));

        let TestRun {
            name,
            sentinel,
            ctx,
            event_loop,
            ..
        } = self;
        drop(sentinel);
        drop(ctx);
        drop(event_loop);

        match &result {
            Ok(_) => log::debug!("Test '{}' passed in {:?}", name, elapsed),
            Err(failure) => log::debug!("Test '{}' failed: {}", name, failure),
        }
        result
    }
}

/// Lifecycle hooks of a fixture built on a [`TestCase`].
///
/// Each hook is called only once the previous stage has settled on the loop:
/// `set_up_async`, then the body, then `tear_down_async` (also when the body
/// failed, but not when setup did or when the test timed out).
pub trait AsyncFixture {
    /// The base test case
    fn test_case(&mut self) -> &mut TestCase;

    /// Synchronous setup. Overrides must call [`TestCase::set_up`].
    fn set_up(&mut self) {
        self.test_case().set_up();
    }

    /// Asynchronous setup, settled before the body is called
    fn set_up_async(&mut self, _ctx: &TestContext) -> TestOutcome<()> {
        TestOutcome::Immediate(())
    }

    /// Asynchronous teardown, called once the body settled
    fn tear_down_async(&mut self, _ctx: &TestContext) -> TestOutcome<()> {
        TestOutcome::Immediate(())
    }
}

/// Handle given to a running test body
#[derive(Clone)]
pub struct TestContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    name: String,
    handle: Handle,
    timeout: TimeoutGuard,
    minimum_runtime: Cell<Option<Duration>>,
    policy: Cell<WatcherPolicy>,
    expectations: RefCell<Vec<Rc<dyn Expectation>>>,
}

impl TestContext {
    fn new(case: &TestCase, handle: Handle, signal: CompletionSignal, sentinel: SentinelSwitch) -> Self {
        let policy = WatcherPolicy {
            ignore_all: false,
            include_unreferenced: case.config.check_unreferenced_watchers,
        };

        Self {
            inner: Rc::new(ContextInner {
                name: case.name.clone(),
                timeout: TimeoutGuard::new(handle.clone(), signal, sentinel, case.config.trace_watchers),
                handle,
                minimum_runtime: Cell::new(None),
                policy: Cell::new(policy),
                expectations: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Name of the running test
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle to the test's event loop
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Future completing after `duration` on the test's loop
    #[track_caller]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.inner.handle.sleep(duration)
    }

    /// Fail the test unless it settles within `limit`; replaces an earlier timeout
    #[track_caller]
    pub fn set_timeout(&self, limit: Duration) {
        self.inner.timeout.arm(limit);
    }

    /// Disarm the timeout, if one is set
    pub fn cancel_timeout(&self) {
        self.inner.timeout.cancel();
    }

    /// Fail the test if it settles faster than `runtime` (at least 1ms)
    pub fn set_minimum_runtime(&self, runtime: Duration) -> Result<()> {
        if runtime < Duration::from_millis(1) {
            return Err(Error::InvalidConfiguration {
                reason: "Minimum runtime must be at least 1ms".to_string(),
            });
        }
        self.inner.minimum_runtime.set(Some(runtime));
        Ok(())
    }

    /// Don't fail the test on leftover watchers
    pub fn ignore_loop_watchers(&self) {
        self.update_policy(|policy| policy.ignore_all = true);
    }

    /// Fail on leftover unreferenced watchers as well
    pub fn check_unreferenced_loop_watchers(&self) {
        self.update_policy(|policy| policy.include_unreferenced = true);
    }

    /// Current leak policy
    pub fn watcher_policy(&self) -> WatcherPolicy {
        self.inner.policy.get()
    }

    fn update_policy(&self, update: impl FnOnce(&mut WatcherPolicy)) {
        let mut policy = self.inner.policy.get();
        update(&mut policy);
        self.inner.policy.set(policy);
    }

    /// Callback that fails the test unless invoked exactly `expected_calls` times
    #[track_caller]
    pub fn create_callback<A>(&self, expected_calls: usize) -> CallbackStub<A>
    where
        A: fmt::Debug + PartialEq + 'static,
    {
        self.register(CallbackStub::build(expected_calls, None, None, Location::caller()))
    }

    /// Like [`create_callback`](Self::create_callback), answering with `returns`
    #[track_caller]
    pub fn create_callback_returning<A, R, F>(&self, expected_calls: usize, returns: F) -> CallbackStub<A, R>
    where
        A: fmt::Debug + PartialEq + 'static,
        R: Default + 'static,
        F: Fn(&A) -> R + 'static,
    {
        self.register(CallbackStub::build(
            expected_calls,
            Some(Box::new(returns)),
            None,
            Location::caller(),
        ))
    }

    /// Like [`create_callback`](Self::create_callback), also requiring `args` on every call
    #[track_caller]
    pub fn create_callback_with_args<A>(&self, expected_calls: usize, args: A) -> CallbackStub<A>
    where
        A: fmt::Debug + PartialEq + 'static,
    {
        self.register(CallbackStub::build(expected_calls, None, Some(args), Location::caller()))
    }

    fn register<A, R>(&self, stub: CallbackStub<A, R>) -> CallbackStub<A, R>
    where
        A: fmt::Debug + PartialEq + 'static,
        R: Default + 'static,
    {
        self.inner.expectations.borrow_mut().push(stub.expectation());
        stub
    }

    fn check_runtime(&self, elapsed: Duration) -> std::result::Result<(), TestFailure> {
        let Some(required) = self.inner.minimum_runtime.get() else {
            return Ok(());
        };

        greater_or_equal(&round_millis(required), &round_millis(elapsed), "Minimum runtime not reached").map_err(
            |comparison| {
                log::debug!("{}", comparison);
                TestFailure::RuntimeTooShort {
                    required,
                    actual: elapsed,
                }
            },
        )
    }

    fn verify_callbacks(&self) -> std::result::Result<(), TestFailure> {
        self.inner
            .expectations
            .borrow()
            .iter()
            .try_for_each(|expectation| expectation.verify())
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("name", &self.inner.name)
            .field("minimum_runtime", &self.inner.minimum_runtime.get())
            .field("policy", &self.inner.policy.get())
            .finish()
    }
}
