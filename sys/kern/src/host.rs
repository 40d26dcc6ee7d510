// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host object: the machine's public identity, as a pair of kernel
//! ports.

use spin::Once;

use crate::port::{KernCtx, Port, PortRef};

pub struct Host {
    ctrl: PortRef,
    name: PortRef,
}

static HOST: Once<Host> = Once::new();

/// Creates the host ports. Called once at boot.
pub fn init() {
    HOST.call_once(|| Host {
        ctrl: Port::new_kernel(KernCtx::HostCtl),
        name: Port::new_kernel(KernCtx::HostName),
    });
}

fn host() -> &'static Host {
    HOST.get().expect("host not initialized")
}

/// The privileged host control port.
pub fn ctrl_port() -> PortRef {
    host().ctrl.clone()
}

/// The unprivileged host name port.
pub fn name_port() -> PortRef {
    host().name.clone()
}
