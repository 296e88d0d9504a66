//! Named rendezvous breakpoints for tests. A test installs a `PauseClient`
//! in the code under test and holds the matching `PauseController`; the
//! client blocks at `wait(label)` until the controller observes it and
//! unpauses. Outside testing builds `PauseClient` is a no-op.

#[cfg(any(test, feature = "testing"))]
mod test_pause {
    use std::collections::BTreeMap;

    use futures::{
        channel::mpsc,
        SinkExt,
        StreamExt,
    };

    #[derive(Default)]
    pub struct PauseClient {
        channels: BTreeMap<&'static str, mpsc::Receiver<()>>,
    }

    impl PauseClient {
        /// A disconnected client: every `wait` falls straight through. Use
        /// `PauseController::new` to install breakpoints.
        pub fn new() -> Self {
            Self::default()
        }

        /// Block on the named breakpoint until the controller unpauses it.
        /// Unregistered labels fall through immediately.
        pub async fn wait(&mut self, label: &'static str) {
            let Some(rendezvous) = self.channels.get_mut(&label) else {
                return;
            };
            // First recv hands control to the controller, second waits for
            // the unpause. A disconnected controller means the test has
            // moved on; keep going.
            if rendezvous.next().await.is_none() {
                self.channels.remove(&label);
                return;
            }
            if rendezvous.next().await.is_none() {
                self.channels.remove(&label);
            }
        }

        pub fn close(&mut self, label: &'static str) {
            if let Some(mut rendezvous) = self.channels.remove(&label) {
                rendezvous.close();
            }
        }
    }

    pub struct PauseController {
        channels: BTreeMap<&'static str, mpsc::Sender<()>>,
    }

    pub struct PauseGuard<'a> {
        controller: &'a mut PauseController,
        label: &'static str,
        unpaused: bool,
    }

    impl PauseGuard<'_> {
        /// Allow the paused code to resume.
        pub fn unpause(&mut self) {
            if self.unpaused {
                return;
            }
            self.unpaused = true;
            let Some(rendezvous) = self.controller.channels.get_mut(&self.label) else {
                return;
            };
            if rendezvous.try_send(()).is_err() {
                self.controller.channels.remove(&self.label);
            }
        }
    }

    impl Drop for PauseGuard<'_> {
        fn drop(&mut self) {
            if !self.unpaused {
                self.unpause();
            }
        }
    }

    impl PauseController {
        pub fn new(labels: impl IntoIterator<Item = &'static str>) -> (Self, PauseClient) {
            let mut controller = Self {
                channels: BTreeMap::new(),
            };
            let mut client = PauseClient::default();
            for label in labels {
                // Zero-capacity rendezvous channel: the controller's send
                // blocks until the client reaches the breakpoint.
                let (tx, rx) = mpsc::channel(0);
                controller.channels.insert(label, tx);
                client.channels.insert(label, rx);
            }
            (controller, client)
        }

        /// Wait for the client to hit the named breakpoint. Returns `None`
        /// if the client exited or closed the breakpoint.
        pub async fn wait_for_blocked(&mut self, label: &'static str) -> Option<PauseGuard<'_>> {
            let rendezvous = self.channels.get_mut(&label)?;
            if rendezvous.send(()).await.is_err() {
                self.channels.remove(&label);
                return None;
            }
            Some(PauseGuard {
                controller: self,
                label,
                unpaused: false,
            })
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use self::test_pause::{
    PauseClient,
    PauseController,
};

#[cfg(not(any(test, feature = "testing")))]
mod prod_pause {
    #[derive(Default)]
    pub struct PauseClient;

    impl PauseClient {
        pub fn new() -> Self {
            Self
        }

        pub async fn wait(&mut self, _label: &'static str) {}

        pub fn close(&mut self, _label: &'static str) {}
    }
}

#[cfg(not(any(test, feature = "testing")))]
pub use self::prod_pause::PauseClient;
