//! Walkthrough: a context, a pool tree, scoped cleanup and block reuse.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use region_pool::{Context, ErrorCode};

struct Connection {
    name: &'static str,
    closed: Rc<RefCell<Vec<&'static str>>>,
}

unsafe fn close_connection(tracked: NonNull<()>) {
    // SAFETY: Registered below with a live `Connection`.
    let conn = unsafe { tracked.cast::<Connection>().as_ref() };
    conn.closed.borrow_mut().push(conn.name);
    println!("closed connection {:?}", conn.name);
}

fn main() {
    let ctx = Context::builder().stdsize(4096).build();
    let request = ctx.root_pool();

    // Request-scoped scratch memory: individual frees are never needed.
    let header = request.strdup("GET /index HTTP/1.1");
    // SAFETY: strdup returned a NUL-terminated copy.
    let header_len = unsafe {
        let mut len = 0;
        while *header.as_ptr().add(len) != 0 {
            len += 1;
        }
        len
    };
    println!("copied a {header_len}-byte request line into the pool");

    // A subtask works in its own child pool.
    let parser = request.child();
    for chunk in 0..4 {
        let buf = parser.alloc(512);
        // SAFETY: 512 fresh bytes per chunk.
        unsafe { buf.as_ptr().write_bytes(chunk, 512) };
    }
    println!("parser pool grew to {} block(s)", parser.standard_block_count());

    // Resources registered on the pool are closed before its memory is
    // reused, newest first.
    let closed = Rc::new(RefCell::new(Vec::new()));
    let db = Connection { name: "db", closed: Rc::clone(&closed) };
    let cache = Connection { name: "cache", closed: Rc::clone(&closed) };
    // SAFETY: The connections outlive the pool clear below.
    unsafe {
        request.cleanup_register(NonNull::from(&db).cast(), close_connection);
        request.cleanup_register(NonNull::from(&cache).cast(), close_connection);
    }

    // Errors ride on the context until someone acknowledges them.
    let err = ctx
        .error_create(ErrorCode(404), "index not found")
        .wrap(ErrorCode(500), "request failed");
    println!("pending error: {:?} ({})", err.message(), err.code());
    err.handled();

    // One stroke reclaims the whole request: cleanups run, the parser
    // pool dies with its parent, blocks return to the context cache.
    // SAFETY: Nothing allocated from `request` or `parser` is used below.
    unsafe { request.clear() };
    println!("cleanup order: {:?}", closed.borrow());
    println!(
        "context now caches {} standard block(s)",
        ctx.cached_standard_blocks()
    );
}
