// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, ops::BitOr};

/// Which runtime actions a shared object access requests. The iteration's own mask is applied
/// on top, so the serial executor turns every access into a no-op.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodFlag(u8);

impl MethodFlag {
    pub const NONE: MethodFlag = MethodFlag(0);
    /// Acquire the object's abstract lock, arbitrating on conflict.
    pub const CHECK_CONFLICT: MethodFlag = MethodFlag(1);
    /// Register an undo action restoring the object on abort.
    pub const SAVE_UNDO: MethodFlag = MethodFlag(1 << 1);
    pub const ALL: MethodFlag = MethodFlag(Self::CHECK_CONFLICT.0 | Self::SAVE_UNDO.0);

    pub const fn contains(self, other: MethodFlag) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersection(self, other: MethodFlag) -> MethodFlag {
        MethodFlag(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MethodFlag {
    type Output = MethodFlag;

    fn bitor(self, rhs: MethodFlag) -> MethodFlag {
        MethodFlag(self.0 | rhs.0)
    }
}

impl fmt::Debug for MethodFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.contains(Self::CHECK_CONFLICT),
            self.contains(Self::SAVE_UNDO),
        ) {
            (true, true) => write!(f, "MethodFlag(ALL)"),
            (true, false) => write!(f, "MethodFlag(CHECK_CONFLICT)"),
            (false, true) => write!(f, "MethodFlag(SAVE_UNDO)"),
            (false, false) => write!(f, "MethodFlag(NONE)"),
        }
    }
}
