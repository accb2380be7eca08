//! Static window characteristics reported by the window model.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Properties of a window that do not change while it is mapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct WindowFlags: u32 {
        /// The window has an alpha channel.
        const HAS_ALPHA         = 0x01;
        /// System tray icon.
        const TRAY              = 0x02;
        /// Override-redirect (menus, tooltips, popups).
        const OVERRIDE_REDIRECT = 0x04;
        /// Whole-desktop shadow window.
        const SHADOW            = 0x08;
    }
}

impl WindowFlags {
    pub fn has_alpha(self) -> bool {
        self.contains(WindowFlags::HAS_ALPHA)
    }

    pub fn is_tray(self) -> bool {
        self.contains(WindowFlags::TRAY)
    }

    pub fn is_override_redirect(self) -> bool {
        self.contains(WindowFlags::OVERRIDE_REDIRECT)
    }

    pub fn is_shadow(self) -> bool {
        self.contains(WindowFlags::SHADOW)
    }
}
