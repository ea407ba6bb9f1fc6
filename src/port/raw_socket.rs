//! `AF_PACKET` raw socket bound to a single interface.

use super::nic::Nic;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

#[repr(C)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int,
}

/// A non-blocking raw socket receiving all EtherCAT frames on one interface.
#[derive(Debug)]
pub(crate) struct RawSocketDesc {
    protocol: libc::c_short,
    lower: libc::c_int,
}

impl RawSocketDesc {
    pub fn new(name: &str) -> io::Result<Self> {
        let protocol = libc::ETH_P_ALL as i16;

        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                // Receive all protocols; non-EtherCAT frames are dropped in the
                // receive demux
                protocol.to_be() as i32,
            );

            if lower == -1 {
                return Err(io::Error::last_os_error());
            }

            lower
        };

        let mut self_ = Self { protocol, lower };

        self_.bind_interface(name)?;

        Ok(self_)
    }

    fn bind_interface(&mut self, name: &str) -> io::Result<()> {
        let mut ifreq = ifreq_for(name);

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: self.protocol.to_be() as u16,
            sll_ifindex: ifreq_ioctl(self.lower, &mut ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };

        unsafe {
            #[allow(trivial_casts)]
            let res = libc::bind(
                self.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );

            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

impl AsRawFd for RawSocketDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl Drop for RawSocketDesc {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl Nic for RawSocketDesc {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let len = unsafe {
            libc::send(
                self.lower,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };

        if len == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(len as usize)
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = unsafe {
            libc::recv(
                self.lower,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };

        if len == -1 {
            let err = io::Error::last_os_error();

            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err)
            };
        }

        Ok(len as usize)
    }
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    unsafe {
        #[allow(trivial_casts)]
        let res = libc::ioctl(lower, cmd, ifreq as *mut ifreq);

        if res == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> ifreq {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };

    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }

    ifreq
}
