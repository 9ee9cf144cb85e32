//! Link, address and route notifications.

use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use futures::StreamExt;
    use netlink_sys::{AsyncSocket, SocketAddr};
    use tracing::debug;

    // Multicast groups from <linux/rtnetlink.h>.
    const RTMGRP_LINK: u32 = 0x1;
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;
    const RTMGRP_IPV4_ROUTE: u32 = 0x40;
    const RTMGRP_IPV6_IFADDR: u32 = 0x100;
    const RTMGRP_IPV6_ROUTE: u32 = 0x400;

    const GROUPS: u32 = RTMGRP_LINK
        | RTMGRP_IPV4_IFADDR
        | RTMGRP_IPV4_ROUTE
        | RTMGRP_IPV6_IFADDR
        | RTMGRP_IPV6_ROUTE;

    pub(crate) fn subscribe() -> io::Result<(mpsc::UnboundedReceiver<()>, JoinHandle<()>)> {
        let (mut connection, handle, mut messages) = rtnetlink::new_connection()?;
        connection
            .socket_mut()
            .socket_mut()
            .bind(&SocketAddr::new(0, GROUPS))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            // The connection shuts down once every handle is gone.
            let _handle = handle;
            tokio::pin!(connection);
            loop {
                tokio::select! {
                    _ = &mut connection => {
                        debug!("Netlink connection closed");
                        break;
                    }
                    message = messages.next() => match message {
                        Some(_) => {
                            if tx.send(()).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok((rx, task))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub(crate) fn subscribe() -> io::Result<(mpsc::UnboundedReceiver<()>, JoinHandle<()>)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no network change notifications on this platform",
        ))
    }
}

pub(super) use imp::subscribe;
