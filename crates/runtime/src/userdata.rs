//! Opaque proxy for userdata the interpreter created itself
//!
//! Only identity and disposal are offered; the block's contents belong to
//! whatever library created it.

use crate::refs::ForeignRef;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct UserData(pub(crate) ForeignRef);

impl UserData {
    pub fn dispose(&self) {
        self.0.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.0.is_disposed()
    }

    pub(crate) fn identity(&self) -> usize {
        self.0.identity()
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:?})", self.0)
    }
}
