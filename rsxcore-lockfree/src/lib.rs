// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lock-free containers shared by the renderer threads.
//!
//! - [`LfArray`]: append/index-only array growing by CAS-installed blocks.
//! - [`LfFifo`]: push/pop ring positions layered over [`LfArray`].
//! - [`LfQueue`]: multi-producer queue drained all at once by one consumer.
//! - [`LfBunch`]: grow-only bag handing out stable references.

pub mod array;
pub mod bunch;
pub mod fifo;
pub mod queue;

pub use array::LfArray;
pub use bunch::LfBunch;
pub use fifo::LfFifo;
pub use queue::{LfQueue, LfQueueSlice};
