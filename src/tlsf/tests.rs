use quickcheck_macros::quickcheck;
use std::{mem::MaybeUninit, ptr::NonNull, vec::Vec};

use super::*;
use crate::tests::ShadowAllocator;

#[repr(align(64))]
struct Align<T>(T);

/// A tiny deterministic PRNG for shuffling.
struct Xorshift32(u32);

impl Xorshift32 {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

unsafe fn fill(ptr: NonNull<u8>, len: usize, tag: u8) {
    ptr.as_ptr().write_bytes(tag, len);
}

unsafe fn verify(ptr: NonNull<u8>, len: usize, tag: u8) {
    let bytes = std::slice::from_raw_parts(ptr.as_ptr(), len);
    if let Some(i) = bytes.iter().position(|&b| b != tag) {
        panic!(
            "{:p}: byte {} was overwritten ({:#x} != {:#x})",
            ptr, i, bytes[i], tag
        );
    }
}

macro_rules! gen_test {
    ($mod:ident, $($tt:tt)*) => {
        mod $mod {
            use super::*;
            type TheTlsf<'a> = Tlsf<'a, $($tt)*>;

            /// A request size every configuration can serve.
            fn small_size() -> usize {
                TheTlsf::MAX_ALLOC_SIZE.min(40)
            }

            #[test]
            fn minimal() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = [MaybeUninit::uninit(); 65536];
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool).unwrap();

                log::trace!("tlsf = {:?}", tlsf);

                let ptr = tlsf.allocate(1).unwrap();
                log::trace!("ptr = {:?}", ptr);
                assert_eq!(ptr.as_ptr() as usize % GRANULARITY, 0);
                assert!(unsafe { tlsf.usable_size(ptr) } >= 1);
                tlsf.check_integrity();

                unsafe { tlsf.deallocate(ptr.as_ptr()) };
                tlsf.check_integrity();
            }

            #[test]
            fn invalid_arguments() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = [MaybeUninit::uninit(); 65536];
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool).unwrap();

                assert_eq!(tlsf.allocate(0), Err(InvalidArgument::ZeroSize.into()));
                assert_eq!(
                    tlsf.allocate(TheTlsf::MAX_ALLOC_SIZE + 1),
                    Err(InvalidArgument::TooLarge {
                        size: TheTlsf::MAX_ALLOC_SIZE + 1,
                        max: TheTlsf::MAX_ALLOC_SIZE,
                    }
                    .into())
                );
                assert_eq!(
                    tlsf.allocate(usize::MAX),
                    Err(InvalidArgument::TooLarge {
                        size: usize::MAX,
                        max: TheTlsf::MAX_ALLOC_SIZE,
                    }
                    .into())
                );
                assert_eq!(
                    tlsf.allocate_aligned(1, 0),
                    Err(InvalidArgument::Alignment(0).into())
                );
                assert_eq!(
                    tlsf.allocate_aligned(1, 48),
                    Err(InvalidArgument::Alignment(48).into())
                );

                // Null is ignored
                unsafe { tlsf.deallocate(core::ptr::null_mut()) };
                tlsf.check_integrity();
            }

            #[test]
            fn pool_too_small() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 1024]);
                let (pool1, rest) = pool.0.split_at_mut(MIN_POOL_SIZE * 2);
                let (pool2, rest) = rest.split_at_mut(MIN_POOL_SIZE * 2);
                let pool3 = &mut rest[..MIN_POOL_SIZE];
                let mut tlsf: TheTlsf = Tlsf::INIT;

                assert_eq!(
                    tlsf.add_pool(&mut pool1[..MIN_POOL_SIZE - 1]),
                    Err(InvalidArgument::PoolTooSmall {
                        len: MIN_POOL_SIZE - 1,
                        min: MIN_POOL_SIZE,
                    }
                    .into())
                );
                // Misalignment eats into the pool
                assert!(tlsf.add_pool(&mut pool2[1..MIN_POOL_SIZE + 1]).is_err());
                assert_eq!(tlsf.blocks().count(), 0);
                assert!(matches!(
                    tlsf.allocate(1),
                    Err(Error::OutOfMemory { .. })
                ));

                // The smallest pool holds exactly one minimum-sized block
                assert_eq!(tlsf.add_pool(pool3), Ok(GRANULARITY));
                tlsf.check_integrity();
                assert_eq!(tlsf.allocate(1).map(|_| ()), Ok(()));
                assert!(tlsf.allocate(1).is_err());
            }

            #[test]
            fn pool_chunks() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::INIT;
                let available = tlsf.add_pool(&mut pool.0).unwrap();
                tlsf.check_integrity();

                let blocks: Vec<BlockInfo> = tlsf.blocks().collect();
                log::trace!("blocks = {:?}", blocks);
                assert!(!blocks.is_empty());
                assert!(blocks.iter().all(|b| b.is_free));
                assert!(blocks.iter().all(|b| b.size <= TheTlsf::MAX_BLOCK_SIZE));
                assert_eq!(blocks.iter().map(|b| b.size).sum::<usize>(), available);

                if 65536 <= TheTlsf::MAX_BLOCK_SIZE + POOL_OVERHEAD {
                    assert_eq!(blocks.len(), 1);
                    assert_eq!(available, 65536 - POOL_OVERHEAD);
                } else {
                    // Every chunk but the last one is as large as possible
                    assert_eq!(blocks[blocks.len() - 1].size, TheTlsf::MAX_BLOCK_SIZE);
                    assert!(
                        available + blocks.len() * POOL_OVERHEAD + MIN_POOL_SIZE > 65536
                    );
                }
            }

            #[test]
            fn exhaust_and_coalesce() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();
                let initial: Vec<BlockInfo> = tlsf.blocks().collect();

                let mut ptrs = Vec::new();
                let err = loop {
                    match tlsf.allocate(GRANULARITY) {
                        Ok(ptr) => ptrs.push(ptr),
                        Err(e) => break e,
                    }
                };
                log::trace!("{} allocations", ptrs.len());
                assert_eq!(err, Error::OutOfMemory { size: GRANULARITY });
                assert!(tlsf.blocks().all(|b| !b.is_free));
                tlsf.check_integrity();

                // Free in a scrambled order
                let mut rng = Xorshift32(0x2545f491);
                while !ptrs.is_empty() {
                    let i = rng.next() as usize % ptrs.len();
                    let ptr = ptrs.swap_remove(i);
                    unsafe { tlsf.deallocate(ptr.as_ptr()) };
                }
                tlsf.check_integrity();

                // Everything is merged back
                let blocks: Vec<BlockInfo> = tlsf.blocks().collect();
                assert_eq!(blocks, initial);
            }

            #[quickcheck]
            fn round_trip(prefix: Vec<u16>, size: u16) {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();
                for &size in prefix.iter().take(64) {
                    let _ = tlsf.allocate(size as usize % TheTlsf::MAX_ALLOC_SIZE + 1);
                }
                let before: Vec<BlockInfo> = tlsf.blocks().collect();
                let free_lists_before = tlsf.first_free;

                let size = size as usize % TheTlsf::MAX_ALLOC_SIZE + 1;
                if let Ok(ptr) = tlsf.allocate(size) {
                    log::trace!("allocate({}) = {:?}", size, ptr);
                    tlsf.check_integrity();
                    unsafe { tlsf.deallocate(ptr.as_ptr()) };
                }

                tlsf.check_integrity();
                assert_eq!(tlsf.blocks().collect::<Vec<_>>(), before);
                // Same list heads; the bitmap follows from `check_integrity`
                assert_eq!(tlsf.first_free, free_lists_before);
            }

            #[test]
            fn aligned() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();
                let initial: Vec<BlockInfo> = tlsf.blocks().collect();

                let size = small_size();
                let mut ptrs = Vec::new();
                for align_log2 in 0..10 {
                    let align = 1usize << align_log2;
                    let search_size = if align <= GRANULARITY {
                        0
                    } else {
                        crate::utils::align_up(size, GRANULARITY) + align + GAP_MIN
                    };

                    let result = tlsf.allocate_aligned(size, align);
                    log::trace!("allocate_aligned({}, {}) = {:?}", size, align, result);
                    tlsf.check_integrity();

                    if search_size > TheTlsf::MAX_ALLOC_SIZE {
                        assert!(matches!(
                            result,
                            Err(Error::InvalidArgument(InvalidArgument::TooLarge { .. }))
                        ));
                        continue;
                    }

                    let ptr = result.unwrap();
                    assert_eq!(ptr.as_ptr() as usize % align, 0);
                    assert!(unsafe { tlsf.usable_size(ptr) } >= size);
                    ptrs.push(ptr);
                }

                for ptr in ptrs {
                    unsafe { tlsf.deallocate(ptr.as_ptr()) };
                    tlsf.check_integrity();
                }
                assert_eq!(tlsf.blocks().collect::<Vec<_>>(), initial);
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn double_free() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = [MaybeUninit::uninit(); 65536];
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool).unwrap();

                let ptr1 = tlsf.allocate(1).unwrap();
                let _ptr2 = tlsf.allocate(1).unwrap();
                unsafe {
                    tlsf.deallocate(ptr1.as_ptr());
                    tlsf.deallocate(ptr1.as_ptr());
                }
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn free_misaligned() {
                let mut pool = [MaybeUninit::uninit(); 65536];
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool).unwrap();

                let ptr = tlsf.allocate(small_size()).unwrap();
                unsafe { tlsf.deallocate(ptr.as_ptr().add(1)) };
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn free_head_sentinel() {
                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();

                // The first allocation takes the first block of a segment,
                // which directly follows the head sentinel's payload
                let ptr = tlsf.allocate(1).unwrap();
                unsafe {
                    let head = ptr.as_ptr().sub(BLOCK_HDR_SIZE + POOL_HDR_PAYLOAD_SIZE);
                    tlsf.deallocate(head);
                }
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn free_tail_sentinel() {
                let mut pool = Align([MaybeUninit::uninit(); 1024]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0[..MIN_POOL_SIZE]).unwrap();

                // The only block spans the whole segment
                let ptr = tlsf.allocate(1).unwrap();
                unsafe {
                    let tail = ptr.as_ptr().add(tlsf.usable_size(ptr) + BLOCK_HDR_SIZE);
                    tlsf.deallocate(tail);
                }
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn free_with_clobbered_size() {
                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();

                let _ptr1 = tlsf.allocate(small_size()).unwrap();
                let ptr2 = tlsf.allocate(small_size()).unwrap();
                let _ptr3 = tlsf.allocate(small_size()).unwrap();
                unsafe {
                    // Shrink the size field so that the supposed next header
                    // is read from the zeroed payload
                    let usable = tlsf.usable_size(ptr2);
                    ptr2.as_ptr().write_bytes(0, usable);
                    BlockHdr::from_payload(ptr2).as_mut().size = 0;
                    tlsf.deallocate(ptr2.as_ptr());
                }
            }

            #[test]
            #[should_panic(expected = "heap corruption")]
            fn free_with_clobbered_prev_link() {
                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: TheTlsf = Tlsf::new(&mut pool.0).unwrap();

                let _ptr1 = tlsf.allocate(small_size()).unwrap();
                let ptr2 = tlsf.allocate(small_size()).unwrap();
                unsafe {
                    let block = BlockHdr::from_payload(ptr2);
                    (*block.as_ptr()).prev_phys_block = Some(block);
                    tlsf.deallocate(ptr2.as_ptr());
                }
            }

            #[quickcheck]
            fn random(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) {
                random_inner(pool_start, pool_size, bytecode);
            }

            fn random_inner(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) -> Option<()> {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut sa = ShadowAllocator::new();
                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let pool_start = pool_start % 64;
                let pool_size = pool_size % (pool.0.len() - 63);
                let pool = &mut pool.0[pool_start..pool_start + pool_size];
                log::trace!("pool = {:p}: [u8; {}]", pool, pool.len());
                sa.insert_pool(pool);

                let mut tlsf: TheTlsf = Tlsf::INIT;
                if let Err(e) = tlsf.add_pool(pool) {
                    log::trace!("add_pool failed: {}", e);
                    assert!(pool_size < MIN_POOL_SIZE + GRANULARITY);
                    return None;
                }

                log::trace!("tlsf = {:?}", tlsf);

                #[derive(Debug)]
                struct Alloc {
                    ptr: NonNull<u8>,
                    len: usize,
                    usable: usize,
                    tag: u8,
                }
                let mut allocs = Vec::new();
                let mut next_tag = 0u8;

                let mut it = bytecode.iter().cloned();
                loop {
                    tlsf.check_integrity();

                    match it.next()? % 8 {
                        0..=2 => {
                            let len = u32::from_le_bytes([
                                it.next()?,
                                it.next()?,
                                it.next()?,
                                0,
                            ]);
                            let len = ((len as u64 * pool_size as u64) >> 24) as usize;
                            let align = 1 << (it.next()? % 7);
                            log::trace!("alloc {} (align = {})", len, align);

                            let result = tlsf.allocate_aligned(len, align);
                            log::trace!(" → {:?}", result);

                            match result {
                                Ok(ptr) => {
                                    let usable = unsafe { tlsf.usable_size(ptr) };
                                    sa.allocate(ptr, usable, len, align);

                                    next_tag = next_tag.wrapping_add(1);
                                    unsafe { fill(ptr, len, next_tag) };
                                    allocs.push(Alloc {
                                        ptr,
                                        len,
                                        usable,
                                        tag: next_tag,
                                    });
                                }
                                Err(Error::InvalidArgument(InvalidArgument::ZeroSize)) => {
                                    assert_eq!(len, 0);
                                }
                                Err(_) => {}
                            }
                        }
                        3..=5 => {
                            let alloc_i = it.next()?;
                            if !allocs.is_empty() {
                                let alloc = allocs.swap_remove(alloc_i as usize % allocs.len());
                                log::trace!("dealloc {:?}", alloc);

                                unsafe {
                                    verify(alloc.ptr, alloc.len, alloc.tag);
                                    tlsf.deallocate(alloc.ptr.as_ptr());
                                }
                                sa.deallocate(alloc.ptr, alloc.usable);
                            }
                        }
                        6..=7 => {
                            let alloc_i = it.next()?;
                            if !allocs.is_empty() {
                                let len = u32::from_le_bytes([
                                    it.next()?,
                                    it.next()?,
                                    it.next()?,
                                    0,
                                ]);
                                let len = ((len as u64 * pool_size as u64) >> 24) as usize;

                                let alloc_i = alloc_i as usize % allocs.len();
                                let alloc = &mut allocs[alloc_i];
                                log::trace!("realloc {:?} to {:?}", alloc, len);

                                match unsafe { tlsf.reallocate(alloc.ptr.as_ptr(), len) } {
                                    Ok(ptr) => {
                                        log::trace!(" {:?} → {:?}", alloc.ptr, ptr);
                                        let usable = unsafe { tlsf.usable_size(ptr) };

                                        // The contents are preserved
                                        unsafe { verify(ptr, alloc.len.min(len), alloc.tag) };

                                        sa.deallocate(alloc.ptr, alloc.usable);
                                        sa.allocate(ptr, usable, len, GRANULARITY);
                                        alloc.ptr = ptr;
                                        alloc.len = len;
                                        alloc.usable = usable;
                                        unsafe { fill(ptr, len, alloc.tag) };
                                    }
                                    Err(e) => {
                                        log::trace!(" {:?} → {}", alloc.ptr, e);
                                        if len == 0 {
                                            assert_eq!(e, InvalidArgument::ZeroSize.into());
                                        }

                                        // The original block is left intact
                                        unsafe { verify(alloc.ptr, alloc.len, alloc.tag) };
                                    }
                                }
                            }
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    };
}

gen_test!(tlsf_u8_u8_1_2, u8, u8, 1, 2);
gen_test!(tlsf_u8_u8_3_4, u8, u8, 3, 4);
gen_test!(tlsf_u8_u8_8_1, u8, u8, 8, 1);
gen_test!(tlsf_u8_u8_8_8, u8, u8, 8, 8);
gen_test!(tlsf_u16_u8_11_4, u16, u8, 11, 4);
gen_test!(tlsf_u16_u16_11_16, u16, u16, 11, 16);
gen_test!(tlsf_u16_u32_16_32, u16, u32, 16, 32);
gen_test!(tlsf_u32_u32_20_32, u32, u32, 20, 32);
gen_test!(tlsf_u32_u32_24_32, u32, u32, 24, 32);
gen_test!(tlsf_u64_u64_12_64, u64, u64, 12, 64);

#[test]
fn default_tlsf_limits() {
    assert_eq!(DefaultTlsf::MAX_BLOCK_SIZE, (GRANULARITY << 28) - GRANULARITY);
    assert_eq!(DefaultTlsf::MAX_ALLOC_SIZE, 63 << (GRANULARITY_LOG2 + 22));
    assert_eq!(POOL_OVERHEAD, GRANULARITY * 4);
    assert_eq!(MIN_POOL_SIZE, GRANULARITY * 5);
}
