//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹ over caller-provided memory pools.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** Free blocks are indexed by a two-level bitmap, so
//!    finding a suitable one takes two bit scans regardless of how many free
//!    blocks there are.
//!
//!  - **Block headers are stored in place.** Each block carries a header of
//!    [`GRANULARITY`] bytes in front of its payload. Adjacent free blocks are
//!    merged immediately on deallocation.
//!
//!  - **The memory pool is provided by an application.** Any number of pools
//!    can be added at any time. Memory is never returned to the underlying
//!    memory system.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ```rust
//! use segfit::{InvalidArgument, Tlsf};
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//!
//! // `'pool` represents the memory pool's lifetime (`pool` in this case).
//! let mut tlsf: Tlsf<'_, u16, u16, 12, 16> = Tlsf::new(&mut pool).unwrap();
//! //                 ^^            ^^  ^^
//! //                  |             |  |
//! //                'pool           |  SLLEN
//! //                               FLLEN
//!
//! unsafe {
//!     let mut ptr1 = tlsf.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = tlsf.allocate_aligned(8, 64).unwrap().cast::<u64>();
//!     assert_eq!(ptr2.as_ptr() as usize % 64, 0);
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     tlsf.deallocate(ptr1.as_ptr().cast());
//!     tlsf.deallocate(ptr2.as_ptr().cast());
//! }
//!
//! // Invalid requests are reported as errors
//! assert_eq!(
//!     tlsf.allocate(0),
//!     Err(InvalidArgument::ZeroSize.into()),
//! );
//! ```
//!
//! # Logging
//!
//! Pool registration and allocation failures are reported through the [`log`]
//! facade (at `debug` and `trace` levels, respectively). Detected heap
//! corruption is logged at `error` level right before panicking.
//!
//! # Cargo features
//!
//!  - **`std`**: Links the standard library and enables `thiserror`'s `std`
//!    support for [`Error`] and [`InvalidArgument`].
//!  - **`doc_cfg`**: Renders the diagrams in the documentation. Requires a
//!    nightly compiler.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod error;
pub mod int;
mod tlsf;
mod utils;
pub use self::{
    error::{Error, InvalidArgument},
    tlsf::{
        BlockInfo, Blocks, DefaultTlsf, Tlsf, BLOCK_OVERHEAD, GRANULARITY, MIN_POOL_SIZE,
        POOL_OVERHEAD,
    },
};

#[cfg(any(test, feature = "std"))]
extern crate std;
