#![deny(unsafe_op_in_unsafe_fn)]
use cotask_kernel::{Event, Mutex};

cotask_port_std::use_port!(struct SystemTraits);
type System = cotask_kernel::System<SystemTraits>;

static SHARED: Mutex<SystemTraits> = Mutex::new();
static SHUTDOWN: Event<SystemTraits> = Event::new();

const STACK_LEN: usize = 256 * 1024;

fn ticker_body(period_ms: usize) {
    for round in 0.. {
        log::trace!("ticker({period_ms}) round {round}");
        SHARED.lock().unwrap();
        println!("[{:>9} ticks] tick every {period_ms} ms", System::time_ticks().unwrap());
        SHARED.unlock().unwrap();

        if SHUTDOWN
            .wait_timeout(core::time::Duration::from_millis(period_ms as u64))
            .is_ok()
        {
            // The main task asked everyone to stop
            return;
        }
    }
}

fn main() {
    env_logger::init();
    System::init().unwrap();

    let mut stack1 = vec![0u8; STACK_LEN].into_boxed_slice();
    let mut stack2 = vec![0u8; STACK_LEN].into_boxed_slice();
    let task1 =
        unsafe { System::create(stack1.as_mut_ptr(), stack1.len(), ticker_body, 250) }.unwrap();
    let task2 =
        unsafe { System::create(stack2.as_mut_ptr(), stack2.len(), ticker_body, 400) }.unwrap();

    System::sleep_ms(2000).unwrap();

    SHUTDOWN.set().unwrap();
    System::join(task1).unwrap();
    // the broadcast released both tickers, but the flag may have been left
    // latched if one of them was not parked yet
    SHUTDOWN.set().unwrap();
    System::join(task2).unwrap();

    println!("done");
}
