//! Connection to the X server and the queries the remapper needs: mapping
//! tables for the key layout, autorepeat controls, focus and property
//! watching, and the keymap/modmap snapshot written back when external
//! tools rebind modifiers under us.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use x11rb::connection::Connection;
use x11rb::protocol::xkb::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, EventMask, MappingStatus,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::dispatcher::RepeatTiming;
use crate::layout::ServerTables;

const MODMAP_RESTORE_RETRIES: u32 = 20;
const MODMAP_RESTORE_BACKOFF: Duration = Duration::from_millis(100);

/// The server-side keyboard tables saved before any external change, and
/// written back on clean shutdown or after a runtime rebind.
pub struct KeyboardSnapshot {
    min_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: Vec<u32>,
    modmap: Vec<u8>,
}

pub struct XContext {
    conn: RustConnection,
    roots: Vec<u32>,
    pub net_active_window: u32,
    pub xkb_rules_names: u32,
    min_keycode: u8,
    max_keycode: u8,
}

impl XContext {
    /// Connects to the display named by `$DISPLAY` and prepares the xkb
    /// extension.
    pub fn connect() -> Result<XContext> {
        let (conn, _screen) = x11rb::connect(None).context("Could not open X11 display")?;

        let setup = conn.setup();
        let roots = setup.roots.iter().map(|screen| screen.root).collect();
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;

        let (major, minor) = xkb::X11_XML_VERSION;
        conn.xkb_use_extension(major as u16, minor as u16)
            .context("Failed to query the xkb extension")?
            .reply()
            .context("The xkb extension is unsupported")?;

        let net_active_window = conn
            .intern_atom(false, b"_NET_ACTIVE_WINDOW")
            .context("Failed to intern atom")?
            .reply()
            .context("Failed to intern _NET_ACTIVE_WINDOW")?
            .atom;
        let xkb_rules_names = conn
            .intern_atom(false, b"_XKB_RULES_NAMES")
            .context("Failed to intern atom")?
            .reply()
            .context("Failed to intern _XKB_RULES_NAMES")?
            .atom;

        Ok(XContext {
            conn,
            roots,
            net_active_window,
            xkb_rules_names,
            min_keycode,
            max_keycode,
        })
    }

    /// Subscribes to PropertyNotify on every root window.
    pub fn select_property_events(&self) -> Result<()> {
        let attributes = ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE);
        for &root in &self.roots {
            self.conn
                .change_window_attributes(root, &attributes)
                .context("Failed to select PropertyNotify")?
                .check()
                .context("Failed to select PropertyNotify on a root window")?;
        }
        self.conn.flush().context("Failed to flush X connection")?;
        Ok(())
    }

    /// Fetches the keyboard and modifier mappings the key layout is built
    /// from.
    pub fn server_tables(&self) -> Result<ServerTables> {
        let count = self.max_keycode - self.min_keycode + 1;
        let mapping = self
            .conn
            .get_keyboard_mapping(self.min_keycode, count)
            .context("Failed to request keyboard mapping")?
            .reply()
            .context("Failed to get keyboard mapping")?;
        let modifiers = self
            .conn
            .get_modifier_mapping()
            .context("Failed to request modifier mapping")?
            .reply()
            .context("Failed to get modifier mapping")?;

        Ok(ServerTables {
            min_keycode: self.min_keycode,
            keysyms_per_keycode: mapping.keysyms_per_keycode,
            keysyms: mapping.keysyms,
            keycodes_per_modifier: modifiers.keycodes_per_modifier(),
            modmap: modifiers.keycodes,
        })
    }

    /// The server's autorepeat delay and interval from the xkb controls.
    pub fn repeat_timing(&self) -> Result<RepeatTiming> {
        let controls = self
            .conn
            .xkb_get_controls(xkb::ID::USE_CORE_KBD.into())
            .context("Failed to request xkb controls")?
            .reply()
            .context("Failed to get xkb controls")?;
        Ok(RepeatTiming::from_millis(
            controls.repeat_delay,
            controls.repeat_interval,
        ))
    }

    pub fn focused_window(&self) -> Result<u32> {
        let reply = self
            .conn
            .get_input_focus()
            .context("Failed to request input focus")?
            .reply()
            .context("Failed to get input focus")?;
        Ok(reply.focus)
    }

    /// The WM_CLASS pair (instance, class) of a window, if set.
    pub fn window_class(&self, window: u32) -> Result<Option<(String, String)>> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                AtomEnum::WM_CLASS,
                AtomEnum::STRING,
                0,
                2048,
            )
            .context("Failed to request WM_CLASS")?
            .reply()
            .context("Failed to get WM_CLASS")?;
        if reply.value.is_empty() {
            return Ok(None);
        }

        let mut strings = reply.value.split(|&byte| byte == 0);
        let instance = strings.next().unwrap_or_default();
        let class = strings.next().unwrap_or_default();
        Ok(Some((
            String::from_utf8_lossy(instance).into_owned(),
            String::from_utf8_lossy(class).into_owned(),
        )))
    }

    /// The root and parent of a window in the tree.
    pub fn window_parent(&self, window: u32) -> Result<(u32, u32)> {
        let reply = self
            .conn
            .query_tree(window)
            .context("Failed to request window tree")?
            .reply()
            .context("Failed to query window tree")?;
        Ok((reply.root, reply.parent))
    }

    /// The next already-received event, without blocking.
    pub fn poll_event(&self) -> Result<Option<Event>> {
        self.conn
            .poll_for_event()
            .context("Failed to read X event")
    }

    /// Waits up to `timeout_ms` for the connection to become readable.
    /// Returns false on timeout.
    pub fn wait_readable(&self, timeout_ms: u16) -> Result<bool> {
        let fd = self.poll_fd();
        loop {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                        bail!("Lost connection to the X server");
                    }
                    return Ok(true);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(error) => return Err(error).context("poll on X connection failed"),
            }
        }
    }

    pub fn take_snapshot(&self) -> Result<KeyboardSnapshot> {
        debug!("Saving keyboard mapping");
        let tables = self.server_tables()?;
        Ok(KeyboardSnapshot {
            min_keycode: tables.min_keycode,
            keysyms_per_keycode: tables.keysyms_per_keycode,
            keysyms: tables.keysyms,
            modmap: tables.modmap,
        })
    }

    /// Writes a saved keymap and modmap back to the server. The modifier
    /// mapping is retried while the server reports MappingBusy.
    pub fn restore_snapshot(&self, snapshot: &KeyboardSnapshot) -> Result<()> {
        debug!("Restoring keyboard mapping");

        let per = usize::from(snapshot.keysyms_per_keycode);
        let count = (snapshot.keysyms.len() / per.max(1)) as u8;
        self.conn
            .change_keyboard_mapping(
                count,
                snapshot.min_keycode,
                snapshot.keysyms_per_keycode,
                &snapshot.keysyms,
            )
            .context("Failed to restore keyboard mapping")?
            .check()
            .context("The server rejected the restored keyboard mapping")?;

        let mut retries = MODMAP_RESTORE_RETRIES;
        loop {
            let reply = self
                .conn
                .set_modifier_mapping(&snapshot.modmap)
                .context("Failed to restore modifier mapping")?
                .reply()
                .context("The server rejected the restored modifier mapping")?;
            if reply.status == MappingStatus::BUSY {
                retries -= 1;
                if retries == 0 {
                    bail!("set_modifier_mapping kept returning MappingBusy");
                }
                thread::sleep(MODMAP_RESTORE_BACKOFF);
                continue;
            }
            if reply.status != MappingStatus::SUCCESS {
                bail!("set_modifier_mapping returned {:?}", reply.status);
            }
            break;
        }

        self.conn.flush().context("Failed to flush X connection")?;
        Ok(())
    }

    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.conn.stream().as_fd()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.poll_fd().as_raw_fd()
    }
}
