
use evq::Evq;

use std::alloc::Layout;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use structopt::StructOpt;


#[derive(Debug, StructOpt, Clone)]
#[structopt(rename_all="kebab")]
struct Opt {
    /// Number of posting threads
    #[structopt(short, long, default_value="8")]
    posters: usize,

    /// Number of cancelling threads
    #[structopt(short, long, default_value="2")]
    cancellers: usize,

    /// Arena size in bytes
    #[structopt(short, long, default_value="1048576")]
    size: usize,
}

fn main() {
    let opt = Opt::from_args();

    let q = Arc::new(Evq::with_size(opt.size));
    let ids = Arc::new(Mutex::new(Vec::new()));
    let dispatched = Arc::new(AtomicU32::new(0));

    // one dispatch thread
    {
        let q = q.clone();
        thread::spawn(move || {
            q.dispatch(None);
        });
    }

    // posting threads, a mix of raw churn and cancellable events
    for _ in 0..opt.posters {
        let q = q.clone();
        let ids = ids.clone();
        let dispatched = dispatched.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                let dispatched = dispatched.clone();
                match q.call_in(rng.gen_range(0..100), move || {
                    dispatched.fetch_add(1, Ordering::SeqCst);
                }) {
                    Ok(id) => {
                        let mut ids = ids.lock().unwrap();
                        if ids.len() < 10000 {
                            ids.push(id);
                        }
                    }
                    Err(_) => thread::sleep(Duration::from_millis(1)),
                }

                let layout = Layout::from_size_align(
                    rng.gen_range(1..512), 1
                ).unwrap();
                let e = unsafe { q.alloc_raw(layout) };
                if !e.is_null() {
                    unsafe { q.dealloc_raw(e, layout) };
                }

                thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
            }
        });
    }

    // cancelling threads, grabbing random ids, most of which are stale
    for _ in 0..opt.cancellers {
        let q = q.clone();
        let ids = ids.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                let id = {
                    let mut ids = ids.lock().unwrap();
                    if ids.is_empty() {
                        None
                    } else {
                        let i = rng.gen_range(0..ids.len());
                        Some(ids.swap_remove(i))
                    }
                };
                if let Some(id) = id {
                    q.cancel(id);
                }
                thread::sleep(Duration::from_micros(rng.gen_range(0..1000)));
            }
        });
    }

    // and render usage in the main thread
    loop {
        let usage = q.usage();
        println!(
            "dispatched: {}, pending: {} ({} B), alloced: {} ({} B), \
             free: {} ({} B), slab: {}/{}",
            dispatched.load(Ordering::SeqCst),
            usage.pending, usage.pending_bytes,
            usage.alloced, usage.alloced_bytes,
            usage.free, usage.free_bytes,
            usage.slab_unused, usage.slab_total,
        );
        thread::sleep(Duration::from_millis(500));
    }
}
