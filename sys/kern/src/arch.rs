// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names. Off the real target, `fake` stands in: a simulated machine that
//! lives in thread-local storage, so every test thread gets its own.

pub mod context;
pub use context::{SavedState, Word};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "sh")] {
        #[macro_use]
        pub mod sh4;
        pub use sh4::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
