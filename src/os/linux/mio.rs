use crate::context::Context;
use ::mio::event::Source;
use ::mio::unix::SourceFd;
use ::mio::{Interest, Registry, Token};
use nix::poll::PollFlags;
use std::io;

fn interest_for(events: PollFlags, fallback: Interest) -> Interest {
    match (
        events.contains(PollFlags::POLLIN),
        events.contains(PollFlags::POLLOUT),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => fallback,
    }
}

/// Registers every descriptor of [`Context::pollfds`] under one token, each
/// with the readiness it needs. Handles opened or closed later require a
/// `reregister`. On readiness call [`Context::handle_events_timeout`] with a
/// zero timeout.
impl Source for Context {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        for source in self.pollfds() {
            SourceFd(&source.fd).register(registry, token, interest_for(source.events, interests))?;
        }
        Ok(())
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        for source in self.pollfds() {
            let interest = interest_for(source.events, interests);
            match SourceFd(&source.fd).reregister(registry, token, interest) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    SourceFd(&source.fd).register(registry, token, interest)?
                }
                res => res?,
            }
        }
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        for source in self.pollfds() {
            match SourceFd(&source.fd).deregister(registry) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                res => res?,
            }
        }
        Ok(())
    }
}
