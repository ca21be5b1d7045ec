extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};

use collections::bytes::{Cursor, Slice};
use log::error;
use socket2::SockAddr;
use stakker::Fwd;

mod rt;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{c_void as BufType, poll, pollfd as Poll, recvfrom, sendto, sockaddr, sockaddr_storage, socklen_t, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		recvfrom, sendto, WSAPoll as poll, SOCKADDR as sockaddr, SOCKADDR_STORAGE as sockaddr_storage, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN,
		POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub type socklen_t = i32;

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

/// A received datagram together with the address it arrived from.
///
/// The session keys a remote sender not only on its protocol-level
/// `sourceId` but on this transport address, since a socket serving a
/// multicast group sees traffic from many peers on one file
/// descriptor.
pub struct Datagram {
	pub buf: Slice,
	pub from: SocketAddr,
}

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> Result<bool> {
	let addr = SockAddr::from(*addr);

	let r = unsafe { sendto(fd, buf.as_ptr() as *const BufType, buf.len() as _, 0, addr.as_ptr() as *const sockaddr, addr.len() as socklen_t) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv_from(fd: RawFd, buf: &mut Slice) -> Result<Option<SocketAddr>> {
	let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };
	let mut len = core::mem::size_of::<sockaddr_storage>() as socklen_t;

	let r = unsafe { recvfrom(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0, &mut storage as *mut _ as *mut sockaddr, &mut len) };

	let Some(n) = ret_to_err(r as _)? else { return Ok(None) };

	buf.truncate(n);

	let addr = unsafe { SockAddr::new(storage, len) };

	Ok(Some(addr.as_socket().ok_or_else(|| error!("Received datagram from a non-IP address family"))?))
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Log the outstanding write-queue depth of each tracked socket, for
	/// the final status dump on shutdown.
	fn log_stats(&self) {
		for entry in &self.entries {
			log::info!("socket queue depth at shutdown: {}", entry.queue.len());
		}
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

struct Queued {
	buf: Box<[u8]>,
	to: SocketAddr,
}

struct Entry {
	fwd: Fwd<Datagram>,
	queue: VecDeque<Queued>,
}

impl Entry {
	fn flush_read(&mut self, fd: RawFd) -> Result {
		let mut buf = Slice::new(1500);

		while let Some(from) = recv_from(fd, &mut buf)? {
			self.fwd.fwd(Datagram { buf, from });
			buf = Slice::new(1500);
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) -> Result {
		assert!(!self.queue.is_empty());

		loop {
			let Some(Queued { buf, to }) = self.queue.back() else { return Ok(()) };

			if !send_to(fd, buf, to)? {
				return Ok(());
			}

			self.queue.pop_back();
		}
	}
}

/// A non-blocking UDP endpoint, driven by the shared poll loop.
///
/// Unlike a connected socket, a single `Io` here typically serves an
/// entire multicast group: every inbound [`Datagram`] carries the
/// address it arrived from, and every outbound write names its
/// destination explicitly (the multicast group for data traffic, or a
/// specific unicast peer for an ACK/NACK sent back to a sender).
pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, fwd: Fwd<Datagram>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { fwd, queue: VecDeque::new() });

			Self { inner }
		})
	}

	/// Encode a datagram via `f` and send it to `to`, queueing it for
	/// retry on `POLLOUT` if the socket's send buffer is momentarily full.
	pub fn write<X>(&self, to: SocketAddr, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !send_to(as_raw(&self.inner), &vec, &to)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(Queued { buf: vec.into_boxed_slice(), to });
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

/// Socket-option setup for the NORM datagram transport.
///
/// Built on a [`socket2::Socket`] rather than `std::net::UdpSocket`
/// because the standard library doesn't expose multicast TTL, IP
/// TOS/traffic-class, or loopback control uniformly across platforms.
/// The configured socket is converted into a `std::net::UdpSocket`
/// (which implements [`AsRawFd`]) before being handed to [`Io::new`].
pub mod socket {
	use std::io;
	use std::net::{IpAddr, SocketAddr, UdpSocket};

	use socket2::{Domain, Protocol, Socket, Type};

	use super::*;

	/// A multicast group to join on open.
	pub struct MulticastGroup {
		pub group: SocketAddr,
		/// Local interface to join on, or unspecified to let the OS pick
		/// based on the routing table.
		pub interface: Option<IpAddr>,
	}

	/// Parameters for opening the session's transport socket.
	pub struct Config {
		/// Local address to bind to (the multicast group address itself
		/// for a receiver joining a group, or `0.0.0.0:port`/`[::]:port`
		/// for a sender or a unicast-only peer).
		pub bind: SocketAddr,
		pub multicast: Option<MulticastGroup>,
		/// IP or multicast TTL / hop limit.
		pub ttl: u32,
		/// IP_TOS / traffic-class byte, used to carry ECN and DSCP
		/// markings end to end.
		pub tos: u8,
		/// Whether locally sent multicast datagrams loop back to other
		/// sockets on this host joined to the same group.
		pub multicast_loop: bool,
	}

	/// Bind and configure a non-blocking UDP socket per `cfg`.
	pub fn open(cfg: &Config) -> io::Result<UdpSocket> {
		let domain = if cfg.bind.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

		let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

		socket.set_reuse_address(true)?;
		#[cfg(unix)]
		socket.set_reuse_port(true)?;
		socket.set_nonblocking(true)?;

		socket.bind(&SockAddr::from(cfg.bind))?;

		match &cfg.multicast {
			Some(group) if !cfg.bind.is_ipv6() => {
				let IpAddr::V4(group_addr) = group.group.ip() else {
					return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv6 group address on an IPv4 socket"));
				};

				let iface = match group.interface {
					Some(IpAddr::V4(v4)) => v4,
					Some(IpAddr::V6(_)) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv6 interface on an IPv4 socket")),
					None => Ipv4Addr::UNSPECIFIED,
				};

				socket.join_multicast_v4(&group_addr, &iface)?;
				socket.set_multicast_ttl_v4(cfg.ttl)?;
				socket.set_multicast_loop_v4(cfg.multicast_loop)?;
			}
			Some(group) => {
				let IpAddr::V6(group_addr) = group.group.ip() else {
					return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv4 group address on an IPv6 socket"));
				};

				socket.join_multicast_v6(&group_addr, 0)?;
				socket.set_multicast_hops_v6(cfg.ttl)?;
				socket.set_multicast_loop_v6(cfg.multicast_loop)?;
			}
			None if cfg.bind.is_ipv6() => socket.set_unicast_hops_v6(cfg.ttl)?,
			None => socket.set_ttl(cfg.ttl)?,
		}

		#[cfg(unix)]
		if !cfg.bind.is_ipv6() {
			socket.set_tos(cfg.tos as u32)?;
		}

		Ok(socket.into())
	}
}
