// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::{broadcast, mpsc};

/// A connection task's view of server shutdown.
///
/// Also carries a clone of the completion sender. The server's final wait
/// ends when the last `Shutdown` handed to a connection task is dropped.
#[derive(Debug)]
pub struct Shutdown {
    signalled: bool,
    notify: broadcast::Receiver<()>,
    _complete: mpsc::Sender<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>, complete: mpsc::Sender<()>) -> Shutdown {
        Shutdown {
            signalled: false,
            notify,
            _complete: complete,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.signalled
    }

    /// Resolves once shutdown is signalled, immediately on later calls.
    pub async fn recv(&mut self) {
        if self.signalled {
            return;
        }
        // a closed channel means the server is gone
        let _ = self.notify.recv().await;
        self.signalled = true;
    }
}
