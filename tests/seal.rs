//! Root sealing. Lives in its own binary: sealing the registry while a
//! sibling test allocates would fault that test by design.

fn expect_fault(f: impl FnOnce()) {
    // SAFETY: the child runs nothing but `f` and syscalls, then _exits.
    unsafe {
        match libc::fork() {
            0 => {
                let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
                libc::dup2(devnull, 2);
                f();
                libc::_exit(0);
            }
            -1 => panic!("fork failed"),
            child => {
                let mut status = 0;
                libc::waitpid(child, &mut status, 0);
                assert!(
                    libc::WIFSIGNALED(status),
                    "child survived touching the sealed root (status {status:#x})"
                );
                let sig = libc::WTERMSIG(status);
                assert!(sig == libc::SIGSEGV || sig == libc::SIGBUS, "died by {sig}");
            }
        }
    }
}

#[test]
fn seal_and_unseal() {
    // A sealed root faults the next allocation.
    expect_fault(|| {
        let p = palisade::alloc(32);
        unsafe { palisade::free(p) };
        palisade::protect_root();
        palisade::alloc(32);
    });

    // Unsealing restores service.
    palisade::protect_root();
    palisade::unprotect_root();
    let p = palisade::alloc(32);
    assert!(!p.is_null());
    unsafe { palisade::free(p) };
    palisade::verify_all();
}
