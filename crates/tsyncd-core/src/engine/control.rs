//! The external command channel: a unix datagram socket under /run.
//!
//! Commands are single text lines; responses are informational log lines,
//! echoed back to the sender when it bound a reply address.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// A parsed control command.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Exit,
    LogRotate,
    StepClocks,
    /// Pin selection to the named instance; empty clears the pin.
    SelectInstance(Option<String>),
    TestMode {
        id: u32,
        params: [i64; 3],
    },
    PidAdjust {
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        /// Bitmask choosing which servos the adjustment applies to.
        servo_mask: u64,
        reset: bool,
    },
    DumpTables,
}

/// Parse one command line. Unknown commands and malformed arguments are
/// errors the engine answers with a diagnostic.
pub fn parse_command(line: &str) -> Result<ControlCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();
    match verb {
        "exit" => Ok(ControlCommand::Exit),
        "logrotate" => Ok(ControlCommand::LogRotate),
        "stepclocks" => Ok(ControlCommand::StepClocks),
        "selectinstance" => Ok(ControlCommand::SelectInstance(
            args.first().map(|s| s.to_string()).filter(|s| s != "none"),
        )),
        "testmode" => {
            let id = args
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Protocol("testmode <id> <p0> <p1> <p2>".into()))?;
            let mut params = [0i64; 3];
            for (i, p) in params.iter_mut().enumerate() {
                *p = args.get(1 + i).and_then(|s| s.parse().ok()).unwrap_or(0);
            }
            Ok(ControlCommand::TestMode { id, params })
        }
        "pid_adjust" => {
            let parse_coeff = |s: Option<&&str>| -> Option<f64> {
                s.and_then(|v| if *v == "-" { None } else { v.parse().ok() })
            };
            if args.len() < 4 {
                return Err(Error::Protocol(
                    "pid_adjust <kp> <ki> <kd> <servo-mask> [reset]".into(),
                ));
            }
            let servo_mask = args[3]
                .parse()
                .map_err(|_| Error::Protocol("bad servo mask".into()))?;
            Ok(ControlCommand::PidAdjust {
                kp: parse_coeff(args.first()),
                ki: parse_coeff(args.get(1)),
                kd: parse_coeff(args.get(2)),
                servo_mask,
                reset: args.get(4) == Some(&"reset"),
            })
        }
        "dumptables" => Ok(ControlCommand::DumpTables),
        other => Err(Error::Protocol(format!("unknown command '{other}'"))),
    }
}

/// The bound control socket.
pub struct ControlSocket {
    fd: RawFd,
    path: String,
}

impl ControlSocket {
    pub fn open(path: &str) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = unsafe {
            libc::socket(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        if path.len() >= addr.sun_path.len() {
            unsafe { libc::close(fd) };
            return Err(Error::Config(format!("control path too long: {path}")));
        }
        for (i, b) in path.bytes().enumerate() {
            addr.sun_path[i] = b as libc::c_char;
        }
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Error::last_os();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        log::info!("control socket listening at {path}");
        Ok(Self {
            fd,
            path: path.to_string(),
        })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Receive one command datagram, returning the line and the sender's
    /// address for the reply.
    pub fn recv(&self) -> Option<(String, libc::sockaddr_un, libc::socklen_t)> {
        let mut buf = [0u8; 512];
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_un as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if n <= 0 {
            return None;
        }
        let line = String::from_utf8_lossy(&buf[..n as usize])
            .trim_end()
            .to_string();
        Some((line, addr, addr_len))
    }

    /// Best-effort text reply to a command's sender.
    pub fn reply(&self, text: &str, addr: &libc::sockaddr_un, addr_len: libc::socklen_t) {
        if addr_len <= std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t {
            return; // unbound sender, nowhere to answer
        }
        unsafe {
            libc::sendto(
                self.fd,
                text.as_ptr() as *const libc::c_void,
                text.len(),
                0,
                addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            );
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("exit").unwrap(), ControlCommand::Exit);
        assert_eq!(parse_command("logrotate").unwrap(), ControlCommand::LogRotate);
        assert_eq!(parse_command("stepclocks").unwrap(), ControlCommand::StepClocks);
        assert_eq!(parse_command("dumptables").unwrap(), ControlCommand::DumpTables);
        assert!(parse_command("frobnicate").is_err());
    }

    #[test]
    fn test_parse_selectinstance() {
        assert_eq!(
            parse_command("selectinstance ptp1").unwrap(),
            ControlCommand::SelectInstance(Some("ptp1".into()))
        );
        assert_eq!(
            parse_command("selectinstance none").unwrap(),
            ControlCommand::SelectInstance(None)
        );
        assert_eq!(
            parse_command("selectinstance").unwrap(),
            ControlCommand::SelectInstance(None)
        );
    }

    #[test]
    fn test_parse_testmode() {
        assert_eq!(
            parse_command("testmode 2 7 0 -1").unwrap(),
            ControlCommand::TestMode {
                id: 2,
                params: [7, 0, -1]
            }
        );
        assert!(parse_command("testmode").is_err());
    }

    #[test]
    fn test_parse_pid_adjust() {
        assert_eq!(
            parse_command("pid_adjust 0.5 - 0.1 3 reset").unwrap(),
            ControlCommand::PidAdjust {
                kp: Some(0.5),
                ki: None,
                kd: Some(0.1),
                servo_mask: 3,
                reset: true,
            }
        );
        assert!(parse_command("pid_adjust 0.5").is_err());
    }

    #[test]
    fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let sock = ControlSocket::open(path.to_str().unwrap()).unwrap();

        // A client with a bound address gets a reply.
        let client = unsafe {
            libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0)
        };
        assert!(client >= 0);
        let client_path = dir.path().join("client.sock");
        let mut caddr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        caddr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in client_path.to_str().unwrap().bytes().enumerate() {
            caddr.sun_path[i] = b as libc::c_char;
        }
        unsafe {
            libc::bind(
                client,
                &caddr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            );
            let mut saddr: libc::sockaddr_un = std::mem::zeroed();
            saddr.sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (i, b) in path.to_str().unwrap().bytes().enumerate() {
                saddr.sun_path[i] = b as libc::c_char;
            }
            libc::sendto(
                client,
                b"stepclocks\n".as_ptr() as *const libc::c_void,
                11,
                0,
                &saddr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            );
        }

        let (line, addr, addr_len) = sock.recv().unwrap();
        assert_eq!(line, "stepclocks");
        sock.reply("ok\n", &addr, addr_len);

        let mut buf = [0u8; 16];
        let n = unsafe {
            libc::recv(client, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert_eq!(&buf[..n as usize], b"ok\n");
        unsafe { libc::close(client) };
    }
}
