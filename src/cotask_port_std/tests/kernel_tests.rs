//! Kernel scenario tests, driven through the hosted port.
//!
//! Each test defines its own system type (and hence its own kernel state),
//! so the harness may run them on separate threads without interference.
//! Execution ordering is checked with a [`utils::SeqTracker`].
use std::time::{Duration, Instant};

mod utils {
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// An atomic counter for checking an execution sequence.
    pub struct SeqTracker {
        counter: AtomicUsize,
    }

    impl SeqTracker {
        pub const fn new() -> Self {
            Self {
                counter: AtomicUsize::new(0),
            }
        }

        pub fn get(&self) -> usize {
            self.counter.load(Ordering::Relaxed)
        }

        /// Assert that the counter is equal to `old` and then replace it
        /// with `new`.
        #[track_caller]
        pub fn expect_and_replace(&self, old: usize, new: usize) {
            let got = self.counter.load(Ordering::Relaxed);
            log::debug!("{} (expected: {}) → {}", got, old, new);
            assert_eq!(got, old, "expected {}, got {}", old, got);
            self.counter.store(new, Ordering::Relaxed);
        }
    }
}

use utils::SeqTracker;

const STACK_LEN: usize = 256 * 1024;

fn new_stack() -> Box<[u8]> {
    vec![0u8; STACK_LEN].into_boxed_slice()
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two sleeping tasks interleave: the shorter sleeper finishes first, and
/// the total wall time is governed by the longer sleep.
#[test]
fn sleeping_tasks_interleave() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static SEQ: SeqTracker = SeqTracker::new();

    fn task_long(_: usize) {
        System::sleep_ms(500).unwrap();
        SEQ.expect_and_replace(2, 3);
    }
    fn task_short(_: usize) {
        System::sleep_ms(250).unwrap();
        SEQ.expect_and_replace(1, 2);
    }

    init_logger();
    System::init().unwrap();
    SEQ.expect_and_replace(0, 1);

    let started = Instant::now();
    let mut stack_a = new_stack();
    let mut stack_b = new_stack();
    let a = unsafe { System::create(stack_a.as_mut_ptr(), stack_a.len(), task_long, 0) }.unwrap();
    let b = unsafe { System::create(stack_b.as_mut_ptr(), stack_b.len(), task_short, 0) }.unwrap();

    System::join(a).unwrap();
    System::join(b).unwrap();
    SEQ.expect_and_replace(3, 4);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "{elapsed:?}");
}

/// A task sleeping for `d` must not resume before `d` has elapsed on the
/// kernel's own clock.
#[test]
fn sleep_accuracy() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;

    init_logger();
    System::init().unwrap();

    let before = System::time_ticks().unwrap();
    System::sleep(Duration::from_millis(120)).unwrap();
    let after = System::time_ticks().unwrap();

    // one tick per microsecond in this port
    assert!(after.wrapping_sub(before) >= 120_000);
}

/// Contended mutex: waiters acquire in arrival order, and unlocking hands
/// the mutex over directly (it is never observed unlocked in between).
#[test]
fn mutex_fifo_handoff() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static M: cotask_kernel::Mutex<SystemTraits> = cotask_kernel::Mutex::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn contender(index: usize) {
        M.lock().unwrap();
        SEQ.expect_and_replace(index, index + 1);
        M.unlock().unwrap();
    }

    init_logger();
    System::init().unwrap();

    M.lock().unwrap();

    let mut stacks = [new_stack(), new_stack(), new_stack()];
    let tasks = [0, 1, 2].map(|i| {
        unsafe { System::create(stacks[i].as_mut_ptr(), stacks[i].len(), contender, i) }.unwrap()
    });

    // Let all three contenders park on the mutex, in spawn order
    System::yield_now().unwrap();
    assert_eq!(SEQ.get(), 0);

    M.unlock().unwrap();
    // Direct handoff: the first contender owns the mutex already
    assert_eq!(M.is_locked(), Ok(true));

    for task in tasks {
        System::join(task).unwrap();
    }
    SEQ.expect_and_replace(3, 4);
    assert_eq!(M.is_locked(), Ok(false));
}

/// `lock` + `unlock` with no contention leaves the mutex in its initial
/// state; misuse is reported, not absorbed.
#[test]
fn mutex_misc() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static M: cotask_kernel::Mutex<SystemTraits> = cotask_kernel::Mutex::new();

    init_logger();
    System::init().unwrap();

    assert_eq!(M.unlock(), Err(cotask_kernel::UnlockMutexError::NotOwner));

    M.lock().unwrap();
    assert_eq!(M.is_locked(), Ok(true));
    assert_eq!(M.lock(), Err(cotask_kernel::LockMutexError::WouldDeadlock));
    M.unlock().unwrap();
    assert_eq!(M.is_locked(), Ok(false));

    // indistinguishable from the initial state: lockable again
    M.lock().unwrap();
    M.unlock().unwrap();
}

/// `set` wakes every parked waiter in arrival order and leaves the event
/// unflagged.
#[test]
fn event_broadcast() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static E: cotask_kernel::Event<SystemTraits> = cotask_kernel::Event::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn waiter(index: usize) {
        E.wait().unwrap();
        SEQ.expect_and_replace(index, index + 1);
    }

    init_logger();
    System::init().unwrap();

    let mut stacks = [new_stack(), new_stack(), new_stack()];
    let tasks = [1, 2, 3].map(|i| {
        unsafe { System::create(stacks[i - 1].as_mut_ptr(), STACK_LEN, waiter, i) }.unwrap()
    });

    // Let the waiters park
    System::yield_now().unwrap();
    SEQ.expect_and_replace(0, 1);

    E.set().unwrap();
    for task in tasks {
        System::join(task).unwrap();
    }
    SEQ.expect_and_replace(4, 5);

    // The broadcast did not latch the flag: a bounded wait now times out
    assert_eq!(
        E.wait_timeout(Duration::from_millis(50)),
        Err(cotask_kernel::WaitEventTimeoutError::Timeout)
    );
}

/// A latched event is consumed by the first wait; setting it twice is
/// idempotent.
#[test]
fn event_latch_consumed_once() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static E: cotask_kernel::Event<SystemTraits> = cotask_kernel::Event::new();

    init_logger();
    System::init().unwrap();

    E.set().unwrap();
    E.set().unwrap();

    // consumes the flag without blocking
    E.wait().unwrap();

    // the second wait blocks (and here, times out)
    assert_eq!(
        E.wait_timeout(Duration::from_millis(50)),
        Err(cotask_kernel::WaitEventTimeoutError::Timeout)
    );

    // `clear` drops a latched flag
    E.set().unwrap();
    E.clear().unwrap();
    assert_eq!(
        E.wait_timeout(Duration::from_millis(50)),
        Err(cotask_kernel::WaitEventTimeoutError::Timeout)
    );
}

/// A bounded wait on an event no one signals reports a timeout at roughly
/// the requested deadline.
#[test]
fn event_timeout() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static E: cotask_kernel::Event<SystemTraits> = cotask_kernel::Event::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn waiter(_: usize) {
        assert_eq!(
            E.wait_timeout(std::time::Duration::from_millis(100)),
            Err(cotask_kernel::WaitEventTimeoutError::Timeout)
        );
        SEQ.expect_and_replace(0, 1);
    }

    init_logger();
    System::init().unwrap();

    let started = Instant::now();
    let mut stack = new_stack();
    let task = unsafe { System::create(stack.as_mut_ptr(), stack.len(), waiter, 0) }.unwrap();
    System::join(task).unwrap();

    SEQ.expect_and_replace(1, 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "{elapsed:?}");
}

/// When the signal beats the deadline, the waiter reports success promptly,
/// and the dead timeout has no residual effect.
#[test]
fn event_timeout_race_lost_by_timer() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static E: cotask_kernel::Event<SystemTraits> = cotask_kernel::Event::new();
    static SEQ: SeqTracker = SeqTracker::new();

    fn waiter(_: usize) {
        assert_eq!(E.wait_timeout(std::time::Duration::from_millis(600)), Ok(()));
        SEQ.expect_and_replace(0, 1);
    }

    init_logger();
    System::init().unwrap();

    let started = Instant::now();
    let mut stack = new_stack();
    let task = unsafe { System::create(stack.as_mut_ptr(), stack.len(), waiter, 0) }.unwrap();

    System::sleep_ms(10).unwrap();
    E.set().unwrap();
    System::join(task).unwrap();
    SEQ.expect_and_replace(1, 2);

    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");

    // Outlive the original deadline: the canceled timeout must not fire
    // (nothing to wake, nothing to corrupt)
    System::sleep_ms(700).unwrap();
    assert_eq!(SEQ.get(), 2);
}

/// Joining an already-exited task returns without blocking, and the stack
/// buffer is reusable immediately afterwards.
#[test]
fn join_after_exit() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static SEQ: SeqTracker = SeqTracker::new();

    fn quick(step: usize) {
        SEQ.expect_and_replace(step, step + 1);
    }

    init_logger();
    System::init().unwrap();

    let mut stack = new_stack();
    let task = unsafe { System::create(stack.as_mut_ptr(), stack.len(), quick, 0) }.unwrap();

    // Let it run to completion first
    System::yield_now().unwrap();
    SEQ.expect_and_replace(1, 2);

    System::join(task).unwrap();
    // joining a Zombie again is still immediate
    System::join(task).unwrap();

    // The buffer may be reused for a new task now
    let task = unsafe { System::create(stack.as_mut_ptr(), stack.len(), quick, 2) }.unwrap();
    System::join(task).unwrap();
    SEQ.expect_and_replace(3, 4);
}

/// Several tasks joining the same target are all released when it exits, in
/// arrival order.
#[test]
fn join_multiple_joiners() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static SEQ: SeqTracker = SeqTracker::new();
    static TARGET: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    fn target(_: usize) {
        System::sleep_ms(50).unwrap();
        SEQ.expect_and_replace(0, 1);
    }
    fn joiner(index: usize) {
        let target = TARGET.load(std::sync::atomic::Ordering::Relaxed) as *mut u8;
        let target = unsafe { cotask_kernel::TaskRef::<SystemTraits>::from_raw(target) };
        System::join(target).unwrap();
        SEQ.expect_and_replace(index, index + 1);
    }

    init_logger();
    System::init().unwrap();

    let mut stacks = [new_stack(), new_stack(), new_stack()];
    let target_task =
        unsafe { System::create(stacks[0].as_mut_ptr(), STACK_LEN, target, 0) }.unwrap();
    TARGET.store(
        target_task.as_raw() as usize,
        std::sync::atomic::Ordering::Relaxed,
    );

    let joiners = [1, 2].map(|i| {
        unsafe { System::create(stacks[i].as_mut_ptr(), STACK_LEN, joiner, i) }.unwrap()
    });

    for task in joiners {
        System::join(task).unwrap();
    }
    SEQ.expect_and_replace(3, 4);
}

/// A task that yields is placed behind every currently ready peer.
#[test]
fn yield_goes_behind_peers() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;
    static SEQ: SeqTracker = SeqTracker::new();

    fn task_a(_: usize) {
        SEQ.expect_and_replace(0, 1);
        System::yield_now().unwrap();
        SEQ.expect_and_replace(2, 3);
    }
    fn task_b(_: usize) {
        SEQ.expect_and_replace(1, 2);
    }

    init_logger();
    System::init().unwrap();

    let mut stack_a = new_stack();
    let mut stack_b = new_stack();
    let a = unsafe { System::create(stack_a.as_mut_ptr(), stack_a.len(), task_a, 0) }.unwrap();
    let b = unsafe { System::create(stack_b.as_mut_ptr(), stack_b.len(), task_b, 0) }.unwrap();

    System::join(a).unwrap();
    System::join(b).unwrap();
    SEQ.expect_and_replace(3, 4);
}

/// Self-join is detected instead of deadlocking, and services demand an
/// initialized system.
#[test]
fn misuse_is_reported() {
    cotask_port_std::use_port!(struct SystemTraits);
    type System = cotask_kernel::System<SystemTraits>;

    init_logger();

    assert_eq!(
        System::yield_now(),
        Err(cotask_kernel::YieldError::BadContext)
    );

    System::init().unwrap();
    assert_eq!(System::init(), Err(cotask_kernel::InitError::AlreadyInit));

    let me = System::current_task().unwrap();
    assert_eq!(System::join(me), Err(cotask_kernel::JoinError::WouldDeadlock));

    // stack too small to hold a record plus a usable stack
    let mut tiny = [0u8; 64];
    fn never(_: usize) {}
    assert_eq!(
        unsafe { System::create(tiny.as_mut_ptr(), tiny.len(), never, 0) },
        Err(cotask_kernel::CreateError::BadParam)
    );

    // durations beyond the timer window are rejected up front
    assert_eq!(
        System::sleep(Duration::from_secs(1u64 << 40)),
        Err(cotask_kernel::SleepError::BadParam)
    );
}
