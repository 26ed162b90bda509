#![cfg(not(feature = "loom"))]

use evq::Evq;

use std::alloc::Layout;
use std::mem::transmute;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[test]
fn test_alloc() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(100, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    assert!(q.contains_raw(e));
    unsafe { q.dealloc_raw(e, layout) };

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_multiple() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(100, 1).unwrap();
    let mut es = vec![];
    for _ in 0..100 {
        let e = unsafe { q.alloc_raw(layout) };
        assert!(!e.is_null());
        es.push(e);
    }

    for i in 0..100 {
        unsafe { q.dealloc_raw(es[i], layout) };
    }

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_many() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let mut es = vec![];
    for i in 0..100 {
        let layout = Layout::from_size_align(i*10, 1).unwrap();
        let e = unsafe { q.alloc_raw(layout) };
        assert!(!e.is_null());
        es.push(e);
    }

    for i in 0..100 {
        let layout = Layout::from_size_align(i*10, 1).unwrap();
        unsafe { q.dealloc_raw(es[i], layout) };
    }

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_repeatedly() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    // same request, same chunk, no new carves
    let layout = Layout::from_size_align(100, 1).unwrap();
    let first = unsafe { q.alloc_raw(layout) };
    assert!(!first.is_null());
    unsafe { q.dealloc_raw(first, layout) };

    for _ in 0..100 {
        let e = unsafe { q.alloc_raw(layout) };
        assert_eq!(e, first);
        unsafe { q.dealloc_raw(e, layout) };
    }

    assert_eq!(q.usage().chunks, 1);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_many_repeatedly() {
    let mut buffer = vec![0; 1024*1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    for _ in 0..100 {
        let mut es = vec![];
        for i in 0..100 {
            let layout = Layout::from_size_align(i*10, 1).unwrap();
            let e = unsafe { q.alloc_raw(layout) };
            assert!(!e.is_null());
            es.push(e);
        }

        for i in 0..100 {
            let layout = Layout::from_size_align(i*10, 1).unwrap();
            unsafe { q.dealloc_raw(es[i], layout) };
        }
    }

    // the carve count settles at the high-water mark
    let usage = q.usage();
    assert_eq!(usage.chunks, usage.free);
    assert_eq!(usage.alloced, 0);
    println!("usage: {:?}", usage);
}

#[test]
fn test_alloc_exhaustion() {
    let mut buffer = vec![0; 1024];
    let q = Evq::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(2*1024, 1).unwrap();
    assert_eq!(unsafe { q.alloc_raw(layout) }, ptr::null_mut());

    let layout = Layout::from_size_align(1024, 1).unwrap();
    assert_eq!(unsafe { q.alloc_raw(layout) }, ptr::null_mut());

    // small allocations must still work after a failed large one
    let layout = Layout::from_size_align(100, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    unsafe { q.dealloc_raw(e, layout) };

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_dtor() {
    let q = Evq::with_size(1024*1024);

    static DROPS: AtomicU32 = AtomicU32::new(0);
    fn dtor(_e: *mut u8) {
        DROPS.fetch_add(1, Ordering::SeqCst);
    }

    let layout = Layout::from_size_align(16, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    unsafe { q.set_raw_drop(e, dtor) };
    unsafe { q.dealloc_raw(e, layout) };

    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_post_raw() {
    let q = Evq::with_size(1024*1024);

    static COUNT: AtomicU32 = AtomicU32::new(0);
    fn cb(_e: *mut u8) {
        COUNT.fetch_add(1, Ordering::SeqCst);
    }

    let layout = Layout::from_size_align(16, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    unsafe { q.set_raw_delay(e, 10) };
    unsafe { q.set_raw_period(e, Some(10)) };
    let id = unsafe { q.post_raw(cb, e) };

    q.dispatch(Some(35));
    assert!(COUNT.load(Ordering::SeqCst) >= 2);

    assert_eq!(q.cancel(id), true);
    q.dispatch(Some(35));
    let count = COUNT.load(Ordering::SeqCst);
    q.dispatch(Some(35));
    assert_eq!(COUNT.load(Ordering::SeqCst), count);

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_usage() {
    let q = Evq::with_size(1024*1024);

    let layout = Layout::from_size_align(100, 1).unwrap();
    let mut es = vec![];
    for _ in 0..10 {
        es.push(unsafe { q.alloc_raw(layout) });
    }

    // every chunk is in exactly one place
    let usage = q.usage();
    assert_eq!(usage.chunks, 10);
    assert_eq!(usage.alloced, 10);
    assert_eq!(usage.free, 0);
    assert_eq!(usage.pending, 0);

    for e in es {
        unsafe { q.dealloc_raw(e, layout) };
    }

    let usage = q.usage();
    assert_eq!(usage.chunks, 10);
    assert_eq!(usage.alloced, 0);
    assert_eq!(usage.free, 10);

    let mut buckets = vec![0; usage.buckets];
    q.bucket_usage(&mut buckets);
    assert_eq!(buckets.iter().sum::<usize>(), usage.free);
    println!("usage: {:#?}", usage);
}