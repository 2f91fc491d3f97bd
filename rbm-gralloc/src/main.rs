// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The allocator service binary.

use log::{error, info, warn};
use rbm_gralloc::allocator::RanchuAllocator;
use rbm_gralloc::service;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::{fs, io, process};

fn main() {
    env_logger::init();

    let param = libc::sched_param { sched_priority: 2 };
    // SAFETY: plain syscall on the current thread
    let rc = unsafe {
        libc::sched_setscheduler(0, libc::SCHED_FIFO | libc::SCHED_RESET_ON_FORK, &param)
    };
    if rc != 0 {
        warn!(
            "failed to set scheduler priority: {}",
            io::Error::last_os_error()
        );
    }

    let allocator = match RanchuAllocator::with_default_backends() {
        Ok(allocator) => Arc::new(allocator),
        Err(err) => {
            error!("failed to reach the host renderer: {err}");
            process::exit(1);
        }
    };

    let path = service::default_socket_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind '{}': {err}", path.display());
            process::exit(1);
        }
    };

    info!("serving {} on {}", service::SERVICE_NAME, path.display());
    if let Err(err) = service::serve(listener, allocator) {
        error!("service loop failed: {err}");
    }

    // the worker pool is not expected to return
    process::exit(1);
}
