//! Command channel: the in-process verbs pushed onto the event loop
//! (spec.md §4.8, §5 "All public verbs... only write to the pipe").
//!
//! The wire format in spec.md §4.8 is a byte-oriented pipe with a
//! 32-byte `{msg_id, size}` header; here the header/payload framing is
//! replaced by a `tokio::mpsc` channel of an already-typed [`Command`],
//! since both ends live in the same process and the framing's only job
//! was crossing that boundary (documented as an Open Question
//! resolution).

use tokio::sync::mpsc;

use crate::hfi::HfiTriple;

/// One message on the command pipe (spec.md §4.7 "Pipe readable").
#[derive(Debug, Clone)]
pub enum Command {
    Terminate,
    ForceOn,
    ForceOff,
    Auto,
    SuvEnter,
    SuvExit,
    HfiEvent(Vec<HfiTriple>),
}

/// Non-blocking sender handle; every public "verb" clones one of these
/// and fires a message without touching core state directly (spec.md
/// §5 "Scheduling model").
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn send(&self, cmd: Command) {
        // An unbounded channel never blocks and only fails once the
        // receiver (the event loop) has shut down, at which point there
        // is nothing left to deliver to.
        let _ = self.tx.send(cmd);
    }

    pub fn force_on(&self) {
        self.send(Command::ForceOn);
    }

    pub fn force_off(&self) {
        self.send(Command::ForceOff);
    }

    pub fn set_auto(&self) {
        self.send(Command::Auto);
    }

    pub fn terminate(&self) {
        self.send(Command::Terminate);
    }

    pub fn suv_enter(&self) {
        self.send(Command::SuvEnter);
    }

    pub fn suv_exit(&self) {
        self.send(Command::SuvExit);
    }

    pub fn notify_hfi_event(&self, triples: Vec<HfiTriple>) {
        self.send(Command::HfiEvent(triples));
    }
}

pub fn channel() -> (CommandSender, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_are_observed_in_send_order() {
        let (sender, mut rx) = channel();
        sender.force_on();
        sender.set_auto();
        sender.terminate();

        assert!(matches!(rx.recv().await.unwrap(), Command::ForceOn));
        assert!(matches!(rx.recv().await.unwrap(), Command::Auto));
        assert!(matches!(rx.recv().await.unwrap(), Command::Terminate));
    }
}
