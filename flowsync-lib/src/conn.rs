//! One netlink connection: a non-blocking NETLINK_ROUTE socket wrapped for
//! the event loop, with the socket options this daemon relies on (strict
//! dump checking, extended acks, capped acks, a large receive buffer).

use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use netlink_packet_utils::DecodeError;
use netlink_sys::{Socket, protocols::NETLINK_ROUTE};
use thiserror::Error;
use tokio::io::unix::AsyncFd;

use crate::wire::{
    self, NLM_F_ACK_TLVS, NLM_F_CAPPED, NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP, NLMSG_OVERRUN,
    NLMSGERR_ATTR_MSG, RawMessage,
};
use crate::wire::attr::{AttrKind, AttrSet, read_i32_ne, spec};

const RECV_BUF_LEN: usize = 32768;
const SOCKET_RCVBUF: libc::c_int = 0x0100_0000; // 16 MiB

const SOL_NETLINK: libc::c_int = 270;
const NETLINK_CAP_ACK: libc::c_int = 10;
const NETLINK_EXT_ACK: libc::c_int = 11;
const NETLINK_GET_STRICT_CHK: libc::c_int = 12;

const SEQ_OFFSET: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{name}: socket error: {source}")]
    Socket {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: malformed datagram: {source}")]
    Malformed {
        name: &'static str,
        #[source]
        source: DecodeError,
    },
}

/// Terminal answer to an in-flight request: an ack, a nack, or the end of a
/// dump. Zero means success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub errno: i32,
}

/// What one readiness cycle on the socket produced.
#[derive(Debug, Default)]
pub struct Burst {
    pub messages: Vec<RawMessage>,
    pub completion: Option<Completion>,
}

const NLMSGERR_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(NLMSGERR_ATTR_MSG, AttrKind::NulString, "NLMSGERR_ATTR_MSG"),
    spec(wire::NLMSGERR_ATTR_OFFS, AttrKind::U32, "NLMSGERR_ATTR_OFFS"),
    spec(wire::NLMSGERR_ATTR_MISS_TYPE, AttrKind::U32, "NLMSGERR_ATTR_MISS_TYPE"),
    spec(wire::NLMSGERR_ATTR_MISS_NEST, AttrKind::U32, "NLMSGERR_ATTR_MISS_NEST"),
];

pub struct Conn {
    fd: AsyncFd<Socket>,
    name: &'static str,
    portid: u32,
    seq: u32,
    /// Sequence number of the request awaiting its completion; `None` on
    /// subscription sockets, which never send.
    pending_seq: Option<u32>,
    check_origin: bool,
}

fn set_socket_opt(fd: i32, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl Conn {
    /// Open and bind a connection, joining `groups` (empty for request
    /// sockets). Request sockets get a sequence counter seeded from the
    /// wall clock XOR the kernel-assigned port id.
    pub fn open(name: &'static str, groups: &[u32]) -> Result<Conn, Error> {
        let err = |source| Error::Socket { name, source };

        let mut socket = Socket::new(NETLINK_ROUTE).map_err(err)?;
        let raw_fd = socket.as_raw_fd();

        set_socket_opt(raw_fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_RCVBUF).map_err(err)?;
        set_socket_opt(raw_fd, SOL_NETLINK, NETLINK_GET_STRICT_CHK, 1).map_err(err)?;
        set_socket_opt(raw_fd, SOL_NETLINK, NETLINK_EXT_ACK, 1).map_err(err)?;
        set_socket_opt(raw_fd, SOL_NETLINK, NETLINK_CAP_ACK, 1).map_err(err)?;

        let addr = socket.bind_auto().map_err(err)?;
        let portid = addr.port_number();
        for &group in groups {
            socket.add_membership(group).map_err(err)?;
        }
        socket.set_non_blocking(true).map_err(err)?;

        let is_request_socket = groups.is_empty();
        let seq = if is_request_socket {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            now ^ portid
        } else {
            0
        };

        let fd = AsyncFd::new(socket).map_err(err)?;
        tracing::debug!(name, portid, "netlink connection open");

        Ok(Conn {
            fd,
            name,
            portid,
            seq,
            pending_seq: None,
            check_origin: is_request_socket,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stamp the next sequence number into the prebuilt message and send it.
    pub fn send_request(&mut self, mut msg: Vec<u8>) -> Result<u32, Error> {
        self.seq = self.seq.wrapping_add(1);
        msg[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&self.seq.to_ne_bytes());

        self.fd
            .get_ref()
            .send(&msg, 0)
            .map_err(|source| Error::Socket { name: self.name, source })?;
        self.pending_seq = Some(self.seq);
        Ok(self.seq)
    }

    /// Wait for readability and drain everything available. Returns once a
    /// completion arrives or the socket runs dry after yielding data.
    pub async fn recv_burst(&mut self) -> Result<Burst, Error> {
        let mut burst = Burst::default();

        loop {
            for datagram in self.recv_ready().await? {
                self.handle_datagram(&datagram, &mut burst)?;
            }
            if burst.completion.is_some() || !burst.messages.is_empty() {
                return Ok(burst);
            }
        }
    }

    /// Block until at least one datagram is readable, then drain the socket.
    async fn recv_ready(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|source| Error::Socket { name: self.name, source })?;

            let mut datagrams = Vec::new();
            loop {
                match guard.try_io(|inner| recv_datagram(inner.get_ref())) {
                    Ok(Ok(datagram)) => datagrams.push(datagram),
                    Ok(Err(source)) => return Err(Error::Socket { name: self.name, source }),
                    Err(_would_block) => break,
                }
            }

            if !datagrams.is_empty() {
                return Ok(datagrams);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], burst: &mut Burst) -> Result<(), Error> {
        let frames = wire::split_frames(datagram).map_err(|source| Error::Malformed {
            name: self.name,
            source,
        })?;

        for frame in frames {
            if self.check_origin {
                let expected = self.pending_seq.unwrap_or(0);
                if frame.port != self.portid || frame.seq != expected {
                    tracing::debug!(
                        name = self.name,
                        port = frame.port,
                        seq = frame.seq,
                        expected,
                        "dropping message from unexpected origin"
                    );
                    continue;
                }
            }

            match frame.message_type {
                NLMSG_NOOP | NLMSG_OVERRUN => {}
                NLMSG_DONE => {
                    let errno = match read_i32_ne(&frame.payload, 0) {
                        Ok(code) if code < 0 => -code,
                        _ => 0,
                    };
                    self.pending_seq = None;
                    burst.completion = Some(Completion { errno });
                }
                NLMSG_ERROR => {
                    let errno = self.handle_nack(&frame);
                    self.pending_seq = None;
                    burst.completion = Some(Completion { errno });
                }
                _ => burst.messages.push(frame),
            }
        }
        Ok(())
    }

    /// An NLMSG_ERROR is an ack when its code is zero, otherwise a nack
    /// possibly annotated with extended-ack attributes.
    fn handle_nack(&self, frame: &RawMessage) -> i32 {
        let code = read_i32_ne(&frame.payload, 0).unwrap_or(0);
        let errno = code.abs();
        if errno == 0 {
            return 0;
        }

        tracing::warn!(
            name = self.name,
            errno,
            "netlink request failed: {}",
            std::io::Error::from_raw_os_error(errno)
        );

        // with capped acks the embedded request is just its header, and the
        // extended-ack attributes follow right after
        if frame.flags & NLM_F_ACK_TLVS != 0 && frame.flags & NLM_F_CAPPED != 0 {
            if let Some(tlvs) = frame.payload.get(4 + 16..) {
                match AttrSet::parse(tlvs, NLMSGERR_ATTRS) {
                    Ok(attrs) => {
                        if let Some(msg) = attrs.get_string(NLMSGERR_ATTR_MSG) {
                            tracing::warn!(name = self.name, "kernel says: {msg}");
                        }
                    }
                    Err(error) => {
                        tracing::debug!(name = self.name, %error, "unparsable extended ack");
                    }
                }
            }
        }

        errno
    }
}

fn recv_datagram(socket: &Socket) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(RECV_BUF_LEN);
    socket.recv(&mut buf, 0)?;
    Ok(buf)
}
