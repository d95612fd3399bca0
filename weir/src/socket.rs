// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

#![allow(clippy::module_name_repetitions)]

use tokio::net::TcpListener;

use crate::error::Error;
#[cfg(target_os = "linux")]
use crate::error::ErrorKind;

#[cfg(target_os = "linux")]
fn bind_device(socket_fd: std::os::unix::io::RawFd, device: &str) -> Result<(), Error> {
    if !device.is_empty() {
        unsafe {
            #[allow(clippy::cast_possible_truncation)]
            let socket_len = device.len() as nc::socklen_t;
            nc::setsockopt(
                socket_fd,
                nc::SOL_SOCKET,
                nc::SO_BINDTODEVICE,
                device.as_ptr().cast::<core::ffi::c_void>(),
                socket_len,
            )
            .map_err(|errno| {
                Error::from_string(
                    ErrorKind::SocketError,
                    format!(
                        "Failed to bind device: {}, err: {}",
                        device,
                        nc::strerror(errno)
                    ),
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::unnecessary_wraps)]
fn bind_device(_socket_fd: i32, _device: &str) -> Result<(), Error> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn enable_fast_open(socket_fd: std::os::unix::io::RawFd) -> Result<(), Error> {
    // For Linux, value is the queue length of pending packets.
    let queue_len: i32 = 5;
    let queue_len_ptr = std::ptr::addr_of!(queue_len).cast::<core::ffi::c_void>();

    unsafe {
        #[allow(clippy::cast_possible_truncation)]
        let len = std::mem::size_of_val(&queue_len) as u32;
        nc::setsockopt(
            socket_fd,
            nc::IPPROTO_TCP,
            nc::TCP_FASTOPEN,
            queue_len_ptr,
            len,
        )
        .map_err(|errno| {
            Error::from_string(
                ErrorKind::SocketError,
                format!(
                    "Failed to enable socket fast open, got err: {}",
                    nc::strerror(errno)
                ),
            )
        })
    }
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::unnecessary_wraps)]
fn enable_fast_open(_socket_fd: i32) -> Result<(), Error> {
    Ok(())
}

/// Create a new tcp server socket at `address` and bind to `device`.
///
/// # Errors
///
/// Returns error if socket `address` is invalid or failed to bind to specific `device`.
pub async fn new_tcp_listener(address: &str, device: &str) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(address).await?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let socket_fd = listener.as_raw_fd();
        bind_device(socket_fd, device)?;
        enable_fast_open(socket_fd)?;
    }
    #[cfg(not(target_os = "linux"))]
    {
        bind_device(0, device)?;
        enable_fast_open(0)?;
    }

    Ok(listener)
}
