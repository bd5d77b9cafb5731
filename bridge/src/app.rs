//! The readiness loop tying the router to real sockets. Input endpoints are
//! watched for readability, output endpoints only while their queues hold
//! data - the router drives the interest set through `IoNotify`, this module
//! translates it into poll registrations.

use crate::config::BridgeConfig;
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::net::SocketAddr;
use txpc::logging;
use txpc::router::{EndpointId, IoNotify, Router};
use txpc::support::{ErrorType, RelayError};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum NotifyKind {
    Read,
    Write,
}

/// Interest requests recorded by the router during an event turn. They are
/// applied to the poll between turns, once the endpoint streams are no
/// longer borrowed.
#[derive(Default)]
pub struct NotifyQueue {
    requests: Vec<(EndpointId, NotifyKind, bool)>,
}

impl NotifyQueue {
    fn take_requests(&mut self) -> Vec<(EndpointId, NotifyKind, bool)> {
        std::mem::take(&mut self.requests)
    }
}

impl IoNotify for NotifyQueue {
    fn notify_read(&mut self, ep: EndpointId, enable: bool) {
        self.requests.push((ep, NotifyKind::Read, enable));
    }

    fn notify_write(&mut self, ep: EndpointId, enable: bool) {
        self.requests.push((ep, NotifyKind::Write, enable));
    }
}

enum Socket {
    /// Bound and waiting for the single peer of this endpoint.
    Listening(TcpListener),
    Connected(TcpStream),
    Closed,
}

struct EndpointState {
    name: String,
    socket: Socket,
    interest: Ready,
    registered: bool,
}

pub struct BridgeApp {
    poll: Poll,
    events: Events,
    endpoints: Vec<EndpointState>,
    router: Router<NotifyQueue>,
    log: logging::Logger,
}

impl BridgeApp {
    pub fn new(config: &BridgeConfig, log: &logging::Logger) -> io::Result<BridgeApp> {
        let poll = Poll::new()?;
        let mut endpoints = Vec::new();
        let mut ids: HashMap<&str, EndpointId> = HashMap::new();

        for endpoint in &config.endpoints {
            endpoint.validate();

            let id = endpoints.len();
            if ids.insert(endpoint.name.as_str(), id).is_some() {
                panic!("Duplicate endpoint name '{}'", endpoint.name);
            }

            let socket = match (&endpoint.listen, &endpoint.connect) {
                (Some(address), _) => {
                    let addr: SocketAddr = address
                        .parse()
                        .unwrap_or_else(|_| panic!("Bad listen address '{}'", address));
                    let listener = TcpListener::bind(&addr)?;
                    poll.register(&listener, Token(id), Ready::readable(), PollOpt::level())?;
                    logging::info!(log, "endpoint listening";
                                   "context" => "setup",
                                   "endpoint" => %endpoint.name,
                                   "address" => %address);
                    Socket::Listening(listener)
                }
                (_, Some(address)) => {
                    let addr: SocketAddr = address
                        .parse()
                        .unwrap_or_else(|_| panic!("Bad connect address '{}'", address));
                    let stream = TcpStream::connect(&addr)?;
                    logging::info!(log, "endpoint connecting";
                                   "context" => "setup",
                                   "endpoint" => %endpoint.name,
                                   "address" => %address);
                    Socket::Connected(stream)
                }
                _ => unreachable!(),
            };

            endpoints.push(EndpointState {
                name: endpoint.name.clone(),
                socket,
                interest: Ready::empty(),
                registered: false,
            });
        }

        let mut router = Router::new(NotifyQueue::default(), log);
        {
            let conn = router.config_mut();
            conn.big_endian = config.connection.big_endian;
            conn.crc_bits = config.connection.crc_bits;
            conn.crc_polynomial = config.connection.crc_polynomial;
        }

        for route in &config.routes {
            let from = *ids
                .get(route.from.as_str())
                .unwrap_or_else(|| panic!("Unknown endpoint '{}' in route", route.from));
            let to = *ids
                .get(route.to.as_str())
                .unwrap_or_else(|| panic!("Unknown endpoint '{}' in route", route.to));
            router.set_route(from, to, route.from_channel, route.to_channel);
        }

        let mut app = BridgeApp {
            poll,
            events: Events::with_capacity(1024),
            endpoints,
            router,
            log: log.new(logging::o!()),
        };

        // Pick up the read interests requested during route setup
        app.apply_notify();

        Ok(app)
    }

    /// Run until every endpoint has closed.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            if self.all_closed() {
                logging::info!(self.log, "all endpoints closed, shutting down";
                               "context" => "run");
                return Ok(());
            }

            self.poll.poll(&mut self.events, None)?;

            let ready: Vec<(Token, Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.readiness()))
                .collect();

            for (token, readiness) in ready {
                self.dispatch_event(token.0, readiness);
            }

            for event in self.router.events() {
                logging::info!(self.log, "link negotiation";
                               "context" => "run",
                               "event" => ?event);
            }

            self.apply_notify();
        }
    }

    fn dispatch_event(&mut self, ep: EndpointId, readiness: Ready) {
        if matches!(self.endpoints[ep].socket, Socket::Listening(_)) {
            self.accept_peer(ep);
            return;
        }

        if matches!(self.endpoints[ep].socket, Socket::Connected(_)) {
            if readiness.is_readable() {
                self.handle_readable(ep);
            }
            if readiness.is_writable() {
                self.handle_writable(ep);
            }
        }
    }

    /// The single peer of a listening endpoint arrived: swap the listener
    /// out for the accepted stream and transfer the endpoint's interest.
    fn accept_peer(&mut self, ep: EndpointId) {
        let accepted = {
            let state = &mut self.endpoints[ep];
            match &state.socket {
                Socket::Listening(listener) => match listener.accept() {
                    Ok((stream, peer)) => {
                        logging::info!(self.log, "peer connected";
                                       "context" => "accept",
                                       "endpoint" => %state.name,
                                       "peer" => %peer);
                        Some(stream)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => {
                        logging::error!(self.log, "accept failed";
                                        "context" => "accept",
                                        "endpoint" => %state.name,
                                        "error" => %e);
                        None
                    }
                },
                _ => None,
            }
        };

        if let Some(stream) = accepted {
            let state = &mut self.endpoints[ep];
            if let Socket::Listening(listener) = &state.socket {
                self.poll
                    .deregister(listener)
                    .expect("Listener deregistration failed");
            }
            state.socket = Socket::Connected(stream);
            state.registered = false;
            self.sync_interest(ep);
        }
    }

    fn handle_readable(&mut self, ep: EndpointId) {
        let mut close = false;
        let mut drop_read_interest = false;

        {
            let state = &mut self.endpoints[ep];
            if let Socket::Connected(stream) = &mut state.socket {
                match self.router.accumulate_msg(ep, stream) {
                    Ok(0) => {
                        // Zero bytes behind a level-triggered readable event
                        // means the peer closed, not a stalled read
                        logging::info!(self.log, "end of stream";
                                       "context" => "read",
                                       "endpoint" => %state.name);
                        close = true;
                    }
                    Ok(_) => (),
                    Err(RelayError::Wait) => (),
                    Err(RelayError::Fatal(ErrorType::UnknownEndpoint)) => {
                        // No route reads from this endpoint; stop watching it
                        logging::warn!(self.log, "readable endpoint has no routes";
                                       "context" => "read",
                                       "endpoint" => %state.name);
                        drop_read_interest = true;
                    }
                    Err(RelayError::Fatal(err)) => {
                        logging::warn!(self.log, "read failed, closing endpoint";
                                       "context" => "read",
                                       "endpoint" => %state.name,
                                       "error" => ?err);
                        close = true;
                    }
                }
            }
        }

        if close {
            self.close_endpoint(ep);
        } else if drop_read_interest {
            self.endpoints[ep].interest.remove(Ready::readable());
            self.sync_interest(ep);
        }
    }

    fn handle_writable(&mut self, ep: EndpointId) {
        let mut close = false;

        {
            let state = &mut self.endpoints[ep];
            if let Socket::Connected(stream) = &mut state.socket {
                match self.router.write_msg(ep, stream) {
                    Ok(_) | Err(RelayError::Wait) => (),
                    Err(RelayError::Fatal(err)) => {
                        logging::warn!(self.log, "write failed, closing endpoint";
                                       "context" => "write",
                                       "endpoint" => %state.name,
                                       "error" => ?err);
                        close = true;
                    }
                }
            }
        }

        if close {
            self.close_endpoint(ep);
        }
    }

    fn close_endpoint(&mut self, ep: EndpointId) {
        let state = &mut self.endpoints[ep];

        if state.registered {
            if let Socket::Connected(stream) = &state.socket {
                let _ = self.poll.deregister(stream);
            }
            state.registered = false;
        }

        logging::info!(self.log, "endpoint closed";
                       "context" => "close",
                       "endpoint" => %state.name);
        state.socket = Socket::Closed;
        state.interest = Ready::empty();
    }

    /// Apply the interest changes the router queued up during this turn.
    fn apply_notify(&mut self) {
        let requests = self.router.notify_mut().take_requests();
        let mut touched: Vec<EndpointId> = Vec::new();

        for (ep, kind, enable) in requests {
            let state = match self.endpoints.get_mut(ep) {
                Some(state) => state,
                None => continue,
            };

            let flag = match kind {
                NotifyKind::Read => Ready::readable(),
                NotifyKind::Write => Ready::writable(),
            };

            if enable {
                state.interest.insert(flag);
            } else {
                state.interest.remove(flag);
            }

            if !touched.contains(&ep) {
                touched.push(ep);
            }
        }

        for ep in touched {
            self.sync_interest(ep);
        }
    }

    /// Bring the poll registration of an endpoint in line with its interest
    /// set. Endpoints with no interest are deregistered entirely so the
    /// loop never spins on them.
    fn sync_interest(&mut self, ep: EndpointId) {
        let state = &mut self.endpoints[ep];

        let stream = match &state.socket {
            Socket::Connected(stream) => stream,
            // Listeners keep their fixed readable registration; interest
            // carries over once the peer arrives
            _ => return,
        };

        if state.interest == Ready::empty() {
            if state.registered {
                self.poll
                    .deregister(stream)
                    .expect("Stream deregistration failed");
                state.registered = false;
            }
        } else if state.registered {
            self.poll
                .reregister(stream, Token(ep), state.interest, PollOpt::level())
                .expect("Stream reregistration failed");
        } else {
            self.poll
                .register(stream, Token(ep), state.interest, PollOpt::level())
                .expect("Stream registration failed");
            state.registered = true;
        }
    }

    fn all_closed(&self) -> bool {
        self.endpoints
            .iter()
            .all(|state| matches!(state.socket, Socket::Closed))
    }
}
