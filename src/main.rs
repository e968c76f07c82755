use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use std::{env, process};

use nbsock::epoll::{Epoll, Interest};
use nbsock::log::{Level, Logger};
use nbsock::net::{Hub, Notice, READ_CHUNK, SocketType, Token, resolve};
use nbsock::{debug, error, info};

const USAGE: &str = "usage: nbsock [-v]... [-u] [-l <log file>] <host> <port>";

const STDIN: u64 = 0;
const HUB: u64 = 1;

#[derive(Debug)]
struct Args {
    verbosity: usize,
    kind: SocketType,
    log_file: Option<String>,
    host: String,
    port: String,
}

fn parse_args() -> Result<Args, String> {
    let mut verbosity = 0;
    let mut kind = SocketType::Stream;
    let mut log_file = None;
    let mut positional = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-u" => kind = SocketType::Datagram,
            "-l" => log_file = Some(args.next().ok_or("missing log file after -l")?),
            "-h" | "--help" => return Err(String::new()),
            flag if flag.starts_with("-v") && flag[1..].chars().all(|c| c == 'v') => {
                verbosity += flag.len() - 1;
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("unknown option: {flag}"));
            }
            _ => positional.push(arg),
        }
    }

    let [host, port]: [String; 2] = positional
        .try_into()
        .map_err(|_| "expected <host> and <port>".to_string())?;

    Ok(Args {
        verbosity,
        kind,
        log_file,
        host,
        port,
    })
}

fn main() {
    let args = parse_args().unwrap_or_else(|err| {
        if !err.is_empty() {
            eprintln!("{err}");
        }
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let level = Level::from_verbosity(args.verbosity);
    let log = match args.log_file {
        Some(ref path) => Logger::to_file(level, path).unwrap_or_else(|err| {
            eprintln!("failed to open log file {path}: {err}");
            process::exit(1);
        }),
        None => Logger::new(level),
    };

    if let Err(err) = run(&args, &log) {
        error!(log, "{err}");
        process::exit(1);
    }
}

/// Connects to the target and shuttles stdin to it and received data to
/// stdout until one side is done. Stdin is not read while earlier input is
/// still waiting to be sent.
fn run(args: &Args, log: &Logger) -> nbsock::Result<()> {
    let endpoints = resolve(&args.host, Some(args.port.as_str()), None, Some(args.kind))?;

    let mut hub = Hub::new(log)?;
    let target = hub.connect_first(args.kind, endpoints)?;

    let outer = Epoll::new(log)?;
    outer.add(&hub, HUB)?;

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut connected = false;
    let mut forwarding = false;

    // Datagram connects complete at once and are reported without the hub
    // becoming readable.
    let mut pending = true;

    loop {
        if pending {
            let mut done = None;
            hub.poll(Some(Duration::ZERO), |notice| {
                on_notice(notice, target, &mut stdout, &mut connected, &mut done)
            })?;

            if let Some(res) = done {
                return res;
            }

            if connected && !forwarding && hub.backlog(target) == 0 {
                outer.register(stdin.as_raw_fd(), Interest::READABLE, STDIN)?;
                forwarding = true;
            }
        }

        pending = false;
        for ev in outer.poll(None)? {
            match ev.tag() {
                STDIN => {
                    let nbytes = stdin.read(&mut buf)?;
                    if nbytes == 0 {
                        info!(log, "stdin closed");
                        return Ok(());
                    }
                    if hub.send_all(target, &buf[..nbytes])? > 0 {
                        debug!(log, "pausing stdin until {target} drains");
                        outer.deregister(stdin.as_raw_fd())?;
                        forwarding = false;
                    }
                }
                HUB => pending = true,
                _ => {}
            }
        }
    }
}

fn on_notice(
    notice: Notice<'_>,
    target: Token,
    stdout: &mut impl Write,
    connected: &mut bool,
    done: &mut Option<nbsock::Result<()>>,
) {
    match notice {
        Notice::Connected(token) if token == target => {
            eprintln!("connection {token} ready");
            *connected = true;
        }
        Notice::Data(_, data) => {
            if let Err(err) = stdout.write_all(data).and_then(|_| stdout.flush()) {
                *done = Some(Err(err.into()));
            }
        }
        Notice::Failed(token, code) if token == target => {
            *done = Some(Err(io::Error::from_raw_os_error(code).into()));
        }
        Notice::Closed(token) if token == target => {
            eprintln!("connection {token} closed by peer");
            *done = Some(Ok(()));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gone;

    impl Write for Gone {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn target(hub: &mut Hub) -> Token {
        let endpoints = resolve("127.0.0.1", Some("9"), None, Some(SocketType::Datagram)).unwrap();
        hub.connect_first(SocketType::Datagram, endpoints).unwrap()
    }

    #[test]
    fn data_is_copied_to_stdout() {
        let mut hub = Hub::new(&Logger::default()).unwrap();
        let target = target(&mut hub);
        let mut out = Vec::new();
        let mut connected = false;
        let mut done = None;

        on_notice(Notice::Connected(target), target, &mut out, &mut connected, &mut done);
        on_notice(Notice::Data(target, b"hi"), target, &mut out, &mut connected, &mut done);

        assert!(connected);
        assert!(done.is_none());
        assert_eq!(out, b"hi");
    }

    #[test]
    fn closed_stdout_ends_the_session() {
        let mut hub = Hub::new(&Logger::default()).unwrap();
        let target = target(&mut hub);
        let mut connected = true;
        let mut done = None;

        on_notice(Notice::Data(target, b"hi"), target, &mut Gone, &mut connected, &mut done);

        match done {
            Some(Err(err)) => {
                assert_eq!(io::Error::from(err).kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected a write error, got {other:?}"),
        }
    }
}
