//! Watches the active Fcitx input method over the session bus.
//!
//! The daemon usually runs as root via sudo while the session bus belongs to
//! the invoking user, so the connection is made with the effective UID
//! switched to `$SUDO_UID`; a drop guard restores it on every exit path.
//! The watcher itself runs on its own thread (D-Bus is push driven) and
//! publishes its result through [`ExclusionFlags`]; the dispatcher picks the
//! flags up between events.

use std::thread::JoinHandle;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::{debug, error, warn};
use nix::unistd::{geteuid, seteuid, Uid};
use zbus::fdo;
use zbus::names::BusName;
use zbus::proxy;

use crate::dispatcher::ExclusionFlags;

const FCITX_BUS_NAME: &str = "org.fcitx.Fcitx";
const FCITX_OBJECT_PATH: &str = "/inputmethod";

#[proxy(
    interface = "org.fcitx.Fcitx.InputMethod",
    default_service = "org.fcitx.Fcitx",
    default_path = "/inputmethod"
)]
trait FcitxInputMethod {
    #[zbus(name = "GetCurrentIM")]
    fn get_current_im(&self) -> zbus::Result<String>;
}

/// Restores the previous effective UID when dropped.
struct ScopedEuid {
    original: Uid,
}

impl ScopedEuid {
    fn switch(target: Uid) -> Result<ScopedEuid> {
        let original = geteuid();
        seteuid(target).with_context(|| format!("seteuid({target}) failed"))?;
        Ok(ScopedEuid { original })
    }
}

impl Drop for ScopedEuid {
    fn drop(&mut self) {
        if let Err(errno) = seteuid(self.original) {
            error!("Failed to restore effective uid {}: {errno}", self.original);
        }
    }
}

pub struct ImMonitor {
    _handle: JoinHandle<()>,
}

impl ImMonitor {
    /// Connects to the invoking user's session bus and spawns the watcher
    /// thread. The monitor lives for the rest of the process, spanning
    /// daemon restarts.
    pub fn start(excluded_input_methods: Vec<String>, flags: ExclusionFlags) -> Result<ImMonitor> {
        let uid_string = std::env::var("SUDO_UID")
            .context("SUDO_UID must be set; run chordd with sudo to watch input methods")?;
        let uid: libc::uid_t = uid_string
            .parse()
            .with_context(|| format!("SUDO_UID `{uid_string}` is not a uid"))?;

        if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_none() {
            std::env::set_var(
                "DBUS_SESSION_BUS_ADDRESS",
                format!("unix:path=/run/user/{uid}/bus"),
            );
        }

        let connection = {
            let _euid = ScopedEuid::switch(Uid::from_raw(uid))?;
            zbus::block_on(zbus::Connection::session()).context(
                "Failed to connect to the session bus. Maybe DBUS_SESSION_BUS_ADDRESS \
                 must be taken over before sudo.",
            )?
        };

        let handle = std::thread::Builder::new()
            .name("im-monitor".to_string())
            .spawn(move || {
                if let Err(error) = watch(connection, excluded_input_methods, flags) {
                    warn!("Input method watcher stopped: {error}");
                }
            })
            .context("Failed to spawn the input method watcher thread")?;

        Ok(ImMonitor { _handle: handle })
    }
}

fn watch(
    connection: zbus::Connection,
    excluded_input_methods: Vec<String>,
    flags: ExclusionFlags,
) -> zbus::Result<()> {
    zbus::block_on(async move {
        let dbus = fdo::DBusProxy::new(&connection).await?;
        let owner_changes = dbus
            .receive_name_owner_changed_with_args(&[(0, FCITX_BUS_NAME)])
            .await?;

        let properties = fdo::PropertiesProxy::builder(&connection)
            .destination(FCITX_BUS_NAME)?
            .path(FCITX_OBJECT_PATH)?
            .build()
            .await?;
        let property_changes = properties.receive_properties_changed().await?;

        let fcitx = FcitxInputMethodProxy::new(&connection).await?;

        update(&dbus, &fcitx, &excluded_input_methods, &flags).await;

        let mut events = futures_util::stream::select(
            owner_changes.map(|_| ()),
            property_changes.map(|_| ()),
        );
        while events.next().await.is_some() {
            update(&dbus, &fcitx, &excluded_input_methods, &flags).await;
        }
        Ok(())
    })
}

/// Re-evaluates the exclusion state: an unowned bus name (no input method
/// running) never excludes.
async fn update(
    dbus: &fdo::DBusProxy<'_>,
    fcitx: &FcitxInputMethodProxy<'_>,
    excluded_input_methods: &[String],
    flags: &ExclusionFlags,
) {
    let Ok(name) = BusName::try_from(FCITX_BUS_NAME) else {
        return;
    };
    let owned = matches!(dbus.name_has_owner(name).await, Ok(true));
    if !owned {
        debug!("{FCITX_BUS_NAME} has no owner; input method exclusion cleared");
        flags.set_im_excluded(false);
        return;
    }

    match fcitx.get_current_im().await {
        Ok(current) => {
            let excluded = excluded_input_methods.iter().any(|name| *name == current);
            debug!("Input method changed: {current}, excluded: {excluded}");
            flags.set_im_excluded(excluded);
        }
        Err(error) => warn!("GetCurrentIM failed: {error}"),
    }
}
