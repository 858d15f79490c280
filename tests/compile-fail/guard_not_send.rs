// Check that read guards cannot be sent to another thread
// edition:2021

use std::thread;

// NOTE: we include this so the error points to local source which gives reliable trybuild output
fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(f).join().unwrap();
}

fn main() {
    let rcu = epoch_rcu::Rcu::new(0u32);
    let guard = rcu.read().unwrap();

    spawn(move || {
        assert_eq!(*guard, 0);
    });
    //~^ ERROR: `*const u32` cannot be sent between threads safely

    drop(rcu);
}
