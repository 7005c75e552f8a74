//! Platform-neutral TCP socket primitives.
//!
//! Thin wrappers over the native socket API. Option setters return a
//! bool and log on failure; creation, bind and listen return the error
//! kind so callers can unwind their setup.

use gannet_core::{net_error, net_info, net_warn};
use gannet_core::{EngineConfig, ErrorKind, NetResult, SocketHandle, INVALID_SOCKET_HANDLE};

#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock as ws;

/// Last OS socket error number.
#[cfg(unix)]
#[inline]
pub fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(windows)]
#[inline]
pub fn last_errno() -> i32 {
    unsafe { ws::WSAGetLastError() }
}

/// One-time platform socket subsystem setup. A no-op on Unix.
#[cfg(unix)]
pub fn init_subsystem() -> bool {
    true
}

#[cfg(windows)]
pub fn init_subsystem() -> bool {
    unsafe {
        let mut data: ws::WSADATA = std::mem::zeroed();
        let ret = ws::WSAStartup(0x0202, &mut data);
        if ret != 0 {
            net_error!("WSAStartup failed. error: {}", ret);
            return false;
        }
    }
    true
}

#[cfg(unix)]
pub fn shutdown_subsystem() {}

#[cfg(windows)]
pub fn shutdown_subsystem() {
    unsafe {
        ws::WSACleanup();
    }
}

/// Create a TCP stream socket.
#[cfg(unix)]
pub fn create_tcp_socket() -> NetResult<SocketHandle> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        let e = last_errno();
        net_error!("failed to create socket. errno: {}", e);
        return Err(ErrorKind::SocketCreate(e));
    }
    Ok(fd)
}

#[cfg(windows)]
pub fn create_tcp_socket() -> NetResult<SocketHandle> {
    let s = unsafe {
        ws::WSASocketW(
            ws::AF_INET as i32,
            ws::SOCK_STREAM as i32,
            ws::IPPROTO_TCP,
            std::ptr::null(),
            0,
            ws::WSA_FLAG_OVERLAPPED,
        )
    };
    if s == ws::INVALID_SOCKET {
        let e = last_errno();
        net_error!("failed to create socket. error: {}", e);
        return Err(ErrorKind::SocketCreate(e));
    }
    Ok(s)
}

#[cfg(unix)]
fn set_opt_i32(socket: SocketHandle, level: i32, name: i32, value: i32) -> bool {
    let ret = unsafe {
        libc::setsockopt(
            socket,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    ret == 0
}

#[cfg(windows)]
fn set_opt_i32(socket: SocketHandle, level: i32, name: i32, value: i32) -> bool {
    let ret = unsafe {
        ws::setsockopt(
            socket,
            level,
            name,
            &value as *const i32 as *const u8,
            std::mem::size_of::<i32>() as i32,
        )
    };
    ret == 0
}

#[cfg(unix)]
pub fn set_non_blocking(socket: SocketHandle, non_blocking: bool) -> bool {
    unsafe {
        let flags = libc::fcntl(socket, libc::F_GETFL, 0);
        if flags < 0 {
            return false;
        }
        let flags = if non_blocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        libc::fcntl(socket, libc::F_SETFL, flags) == 0
    }
}

#[cfg(windows)]
pub fn set_non_blocking(socket: SocketHandle, non_blocking: bool) -> bool {
    let mut mode: u32 = if non_blocking { 1 } else { 0 };
    unsafe { ws::ioctlsocket(socket, ws::FIONBIO, &mut mode) == 0 }
}

pub fn set_reuse_address(socket: SocketHandle, reuse: bool) -> bool {
    #[cfg(unix)]
    let (level, name) = (libc::SOL_SOCKET, libc::SO_REUSEADDR);
    #[cfg(windows)]
    let (level, name) = (ws::SOL_SOCKET, ws::SO_REUSEADDR);
    let ok = set_opt_i32(socket, level, name, reuse as i32);
    if !ok {
        net_warn!("failed to set SO_REUSEADDR. errno: {}", last_errno());
    }
    ok
}

/// Allow multiple listeners on the same port (Linux only).
#[cfg(target_os = "linux")]
pub fn set_reuse_port(socket: SocketHandle, reuse: bool) -> bool {
    let ok = set_opt_i32(socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, reuse as i32);
    if !ok {
        net_warn!("failed to set SO_REUSEPORT. errno: {}", last_errno());
    }
    ok
}

pub fn set_no_delay(socket: SocketHandle, no_delay: bool) -> bool {
    #[cfg(unix)]
    let (level, name) = (libc::IPPROTO_TCP, libc::TCP_NODELAY);
    #[cfg(windows)]
    let (level, name) = (ws::IPPROTO_TCP, ws::TCP_NODELAY);
    set_opt_i32(socket, level, name, no_delay as i32)
}

/// Enable or disable TCP keep-alive, with idle/interval tuning where
/// the platform exposes it.
#[cfg(unix)]
pub fn set_keep_alive(socket: SocketHandle, enable: bool, idle_ms: u32, interval_ms: u32) -> bool {
    if !set_opt_i32(socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as i32) {
        return false;
    }
    if !enable {
        return true;
    }
    // Kernel granularity is seconds
    let idle_s = (idle_ms / 1000).max(1) as i32;
    let interval_s = (interval_ms / 1000).max(1) as i32;
    let mut ok = true;
    #[cfg(target_os = "linux")]
    {
        ok &= set_opt_i32(socket, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, idle_s);
        ok &= set_opt_i32(socket, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, interval_s);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (idle_s, interval_s);
    }
    ok
}

#[cfg(windows)]
pub fn set_keep_alive(socket: SocketHandle, enable: bool, idle_ms: u32, interval_ms: u32) -> bool {
    #[repr(C)]
    struct TcpKeepalive {
        onoff: u32,
        keepalivetime: u32,
        keepaliveinterval: u32,
    }
    let ka = TcpKeepalive {
        onoff: enable as u32,
        keepalivetime: idle_ms,
        keepaliveinterval: interval_ms,
    };
    let mut bytes: u32 = 0;
    let ret = unsafe {
        ws::WSAIoctl(
            socket,
            ws::SIO_KEEPALIVE_VALS,
            &ka as *const TcpKeepalive as *const core::ffi::c_void,
            std::mem::size_of::<TcpKeepalive>() as u32,
            std::ptr::null_mut(),
            0,
            &mut bytes,
            std::ptr::null_mut(),
            None,
        )
    };
    ret == 0
}

pub fn set_send_buf_size(socket: SocketHandle, size: usize) -> bool {
    #[cfg(unix)]
    let (level, name) = (libc::SOL_SOCKET, libc::SO_SNDBUF);
    #[cfg(windows)]
    let (level, name) = (ws::SOL_SOCKET, ws::SO_SNDBUF);
    set_opt_i32(socket, level, name, size as i32)
}

pub fn set_recv_buf_size(socket: SocketHandle, size: usize) -> bool {
    #[cfg(unix)]
    let (level, name) = (libc::SOL_SOCKET, libc::SO_RCVBUF);
    #[cfg(windows)]
    let (level, name) = (ws::SOL_SOCKET, ws::SO_RCVBUF);
    set_opt_i32(socket, level, name, size as i32)
}

/// Apply the per-socket options from the engine configuration.
///
/// Individual failures are logged as warnings and do not abort: a
/// missing option is a tuning loss, not a functional one.
pub fn apply_config(socket: SocketHandle, config: &EngineConfig) {
    if !set_no_delay(socket, config.no_delay) {
        net_warn!("failed to set TCP_NODELAY. errno: {}", last_errno());
    }
    if !set_keep_alive(
        socket,
        config.keep_alive,
        config.keep_alive_idle_ms,
        config.keep_alive_interval_ms,
    ) {
        net_warn!("failed to set keep-alive. errno: {}", last_errno());
    }
    if !set_send_buf_size(socket, config.send_buf_size) {
        net_warn!("failed to set send buffer size. errno: {}", last_errno());
    }
    if !set_recv_buf_size(socket, config.recv_buf_size) {
        net_warn!("failed to set recv buffer size. errno: {}", last_errno());
    }
}

/// Bind to `INADDR_ANY:port`.
#[cfg(unix)]
pub fn bind_any(socket: SocketHandle, port: u16) -> NetResult<()> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = 0; // INADDR_ANY
    addr.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            socket,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let e = last_errno();
        net_error!("bind failed. port: {}, errno: {}", port, e);
        return Err(ErrorKind::SocketBind(e));
    }
    Ok(())
}

#[cfg(windows)]
pub fn bind_any(socket: SocketHandle, port: u16) -> NetResult<()> {
    let mut addr: ws::SOCKADDR_IN = unsafe { std::mem::zeroed() };
    addr.sin_family = ws::AF_INET;
    addr.sin_port = port.to_be();

    let ret = unsafe {
        ws::bind(
            socket,
            &addr as *const ws::SOCKADDR_IN as *const ws::SOCKADDR,
            std::mem::size_of::<ws::SOCKADDR_IN>() as i32,
        )
    };
    if ret != 0 {
        let e = last_errno();
        net_error!("bind failed. port: {}, error: {}", port, e);
        return Err(ErrorKind::SocketBind(e));
    }
    Ok(())
}

pub fn listen(socket: SocketHandle, backlog: u32) -> NetResult<()> {
    #[cfg(unix)]
    let ret = unsafe { libc::listen(socket, backlog as i32) };
    #[cfg(windows)]
    let ret = unsafe { ws::listen(socket, backlog as i32) };
    if ret != 0 {
        let e = last_errno();
        net_error!("listen failed. errno: {}", e);
        return Err(ErrorKind::SocketListen(e));
    }
    net_info!("listening. backlog: {}", backlog);
    Ok(())
}

/// Shut down both directions without closing the handle.
pub fn shutdown_both(socket: SocketHandle) {
    #[cfg(unix)]
    unsafe {
        libc::shutdown(socket, libc::SHUT_RDWR);
    }
    #[cfg(windows)]
    unsafe {
        ws::shutdown(socket, ws::SD_BOTH as i32);
    }
}

/// Close the handle. Safe to call with an invalid handle.
pub fn close(socket: SocketHandle) {
    if socket == INVALID_SOCKET_HANDLE {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::close(socket);
    }
    #[cfg(windows)]
    unsafe {
        ws::closesocket(socket);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_close() {
        assert!(init_subsystem());
        let fd = create_tcp_socket().unwrap();
        assert!(fd >= 0);
        assert!(set_non_blocking(fd, true));
        assert!(set_reuse_address(fd, true));
        assert!(set_no_delay(fd, true));
        assert!(set_keep_alive(fd, true, 60_000, 1000));
        close(fd);
    }

    #[test]
    fn test_bind_and_listen() {
        let fd = create_tcp_socket().unwrap();
        set_reuse_address(fd, true);
        // Port 0: kernel picks a free port, so the test never collides
        assert!(bind_any(fd, 0).is_ok());
        assert!(listen(fd, 16).is_ok());
        shutdown_both(fd);
        close(fd);
    }
}
