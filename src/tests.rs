use rand::{Rng, RngCore, SeedableRng};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::layout::*;
use crate::lock::{self, LockWord};
use crate::range_alloc::{allocate_contiguous_in, allocate_in, free_in, try_extend_in};
use crate::slot_alloc::{Freed, Resized, SlotTable};
use crate::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_fs(num_blocks: u64, block_size: usize) -> (MemBlockDevice, FileSystem) {
    init_logger();
    let dev = MemBlockDevice::new(num_blocks, block_size);
    let fs = FileSystem::format(dev.clone(), num_blocks).unwrap();
    (dev, fs)
}

fn random_bytes(rng: &mut impl RngCore, len: usize) -> Vec<u8> {
    let mut bytes = vec![0_u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn read_all(file: &File) -> Vec<u8> {
    let mut buf = vec![0_u8; file.length().unwrap() as usize];
    file.get_content(0, &mut buf, None).unwrap();
    buf
}

fn check_ranges(ranges: &[BlockRange], num_blocks: u64) {
    let mut prev_end = None;
    for range in ranges {
        assert!(range.count > 0);
        if let Some(prev_end) = prev_end {
            // Disjoint, ascending, and merged.
            assert!(range.start > prev_end, "{ranges:?}");
        }
        prev_end = Some(range.end());
    }
    assert!(prev_end.unwrap_or(0) <= num_blocks);
}

#[test]
fn range_allocator_basic() {
    const NUM_BLOCKS: u64 = 100;
    let mut ranges = vec![BlockRange::new(0, 3)];

    let runs = allocate_in(&mut ranges, NUM_BLOCKS, 10).unwrap();
    assert_eq!(runs, vec![BlockRange::new(3, 10)]);
    assert_eq!(ranges, vec![BlockRange::new(0, 13)]);

    // A hole in the middle is preferred over the tail.
    free_in(&mut ranges, BlockRange::new(5, 4)).unwrap();
    assert_eq!(ranges, vec![BlockRange::new(0, 5), BlockRange::new(9, 4)]);
    let runs = allocate_in(&mut ranges, NUM_BLOCKS, 2).unwrap();
    assert_eq!(runs, vec![BlockRange::new(5, 2)]);

    // Too big for the hole: the tail.
    let runs = allocate_in(&mut ranges, NUM_BLOCKS, 3).unwrap();
    assert_eq!(runs, vec![BlockRange::new(13, 3)]);

    // In place growth.
    assert!(try_extend_in(&mut ranges, NUM_BLOCKS, BlockRange::new(5, 2), 2));
    assert!(!try_extend_in(&mut ranges, NUM_BLOCKS, BlockRange::new(5, 4), 1));
    assert_eq!(ranges, vec![BlockRange::new(0, 16)]);

    // Split across gaps when nothing contiguous is left.
    free_in(&mut ranges, BlockRange::new(4, 2)).unwrap();
    let runs = allocate_in(&mut ranges, NUM_BLOCKS, NUM_BLOCKS - 14).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0], BlockRange::new(4, 2));
    assert_eq!(ranges, vec![BlockRange::new(0, NUM_BLOCKS)]);

    assert_eq!(
        allocate_in(&mut ranges, NUM_BLOCKS, 1).unwrap_err().kind(),
        ErrorKind::StorageFull
    );
    assert_eq!(
        allocate_contiguous_in(&mut ranges, NUM_BLOCKS, 1)
            .unwrap_err()
            .kind(),
        ErrorKind::StorageFull
    );

    // Freeing what is not allocated is a consistency error.
    free_in(&mut ranges, BlockRange::new(10, 10)).unwrap();
    assert_eq!(
        free_in(&mut ranges, BlockRange::new(8, 4)).unwrap_err().kind(),
        ErrorKind::InvalidData
    );
}

#[test]
fn range_allocator_random() {
    init_logger();
    const NUM_BLOCKS: u64 = 1000;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut ranges = vec![BlockRange::new(0, 2)];
    let mut owned: Vec<BlockRange> = Vec::new();

    for _ in 0..5000 {
        if owned.is_empty() || rng.gen_bool(0.55) {
            let count = rng.gen_range(1..40);
            let free: u64 = NUM_BLOCKS - ranges.iter().map(|r| r.count).sum::<u64>();
            match allocate_in(&mut ranges, NUM_BLOCKS, count) {
                Ok(runs) => {
                    assert_eq!(runs.iter().map(|r| r.count).sum::<u64>(), count);
                    owned.extend(runs);
                }
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::StorageFull);
                    assert!(free < count);
                }
            }
        } else {
            let idx = rng.gen_range(0..owned.len());
            let run = owned.swap_remove(idx);
            // Sometimes free only a part of a run.
            if run.count > 2 && rng.gen_bool(0.3) {
                let mid = BlockRange::new(run.start + 1, run.count - 2);
                free_in(&mut ranges, mid).unwrap();
                owned.push(BlockRange::new(run.start, 1));
                owned.push(BlockRange::new(run.end() - 1, 1));
            } else {
                free_in(&mut ranges, run).unwrap();
            }
        }

        check_ranges(&ranges, NUM_BLOCKS);
        let used: u64 = ranges.iter().map(|r| r.count).sum();
        assert_eq!(used, 2 + owned.iter().map(|r| r.count).sum::<u64>());
        assert!(used <= NUM_BLOCKS);
    }
}

fn check_slots(bytes: &[u8], live: &[(usize, usize, u8)]) {
    let entries = crate::slot_alloc::read_entries(bytes).unwrap();
    let table_start = read_u32(bytes, bytes.len() - SLOT_TRAILER_SIZE) as usize;
    let mut prev_end = 0;
    for entry in entries.iter() {
        assert!(entry.start < entry.end);
        assert!(entry.start as usize >= prev_end);
        prev_end = entry.end as usize;
    }
    assert!(prev_end <= table_start);

    let covered: usize = entries.iter().map(|e| (e.end - e.start) as usize).sum();
    assert_eq!(covered, live.iter().map(|(_, len, _)| len).sum::<usize>());

    for (offset, len, fill) in live {
        assert!(
            entries
                .iter()
                .any(|e| e.start as usize <= *offset && offset + len <= e.end as usize)
        );
        assert!(bytes[*offset..(offset + len)].iter().all(|b| b == fill));
    }
}

#[test]
fn slot_table_basic() {
    let mut bytes = vec![0_u8; 512];
    let mut table = SlotTable::init(&mut bytes);
    assert!(table.is_empty().unwrap());
    assert_eq!(table.largest_free().unwrap(), 512 - 4 - 8);

    // A partial fit is centered in the gap.
    let a = table.allocate(100).unwrap();
    assert_eq!(a, (512 - 4 - 8 - 100) / 2);
    assert_eq!(
        table.allocate(0).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );

    // Grows in place when there is room after it.
    assert_eq!(
        table.reallocate(a, 100, 150, true).unwrap(),
        Resized::At(a)
    );
    // Shrinks in place.
    assert_eq!(
        table.reallocate(a, 150, 20, true).unwrap(),
        Resized::At(a)
    );
    // Resizing to nothing frees; the table reports whether it emptied.
    let c = table.allocate(30).unwrap();
    assert_eq!(
        table.reallocate(c, 30, 0, true).unwrap(),
        Resized::Freed(Freed::Slot)
    );
    assert_eq!(
        table.reallocate(a, 20, 0, true).unwrap(),
        Resized::Freed(Freed::Block)
    );
    assert!(table.is_empty().unwrap());

    let b = table.allocate(500).unwrap();
    assert_eq!(b, 0);
    assert_eq!(
        table.allocate(1).unwrap_err().kind(),
        ErrorKind::StorageFull
    );

    // Freeing the middle of an entry splits it, which needs room for
    // one more table entry.
    assert_eq!(
        table.free(100, 50).unwrap_err().kind(),
        ErrorKind::StorageFull
    );
    assert!(!table.free(400, 100).unwrap());
    table.free(100, 50).unwrap();
    assert_eq!(table.entries().unwrap().len(), 2);
    assert_eq!(
        table.free(120, 10).unwrap_err().kind(),
        ErrorKind::InvalidData
    );
    assert!(!table.free(0, 100).unwrap());
    assert!(table.free(150, 250).unwrap());
}

#[test]
fn slot_table_random() {
    init_logger();
    const BLOCK_SIZE: usize = 4096;
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut bytes = vec![0_u8; BLOCK_SIZE];
    SlotTable::init(&mut bytes);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for step in 0..4000 {
        let fill = (step % 251) as u8 + 1;
        let op = rng.gen_range(0..10);
        if live.is_empty() || op < 4 {
            let len = rng.gen_range(1..300);
            match SlotTable::new(&mut bytes).allocate(len) {
                Ok(offset) => {
                    bytes[offset..(offset + len)].fill(fill);
                    live.push((offset, len, fill));
                }
                Err(err) => assert_eq!(err.kind(), ErrorKind::StorageFull),
            }
        } else if op < 7 {
            let idx = rng.gen_range(0..live.len());
            let (offset, len, _) = live[idx];
            match SlotTable::new(&mut bytes).free(offset, len) {
                Ok(_) => {
                    live.swap_remove(idx);
                }
                // Splitting an entry needs room for one more table entry.
                Err(err) => assert_eq!(err.kind(), ErrorKind::StorageFull),
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            let (offset, len, old_fill) = live[idx];
            let new_len = rng.gen_range(1..400);
            match SlotTable::new(&mut bytes).reallocate(offset, len, new_len, true) {
                Ok(Resized::At(new_offset)) => {
                    let kept = len.min(new_len);
                    assert!(
                        bytes[new_offset..(new_offset + kept)]
                            .iter()
                            .all(|b| *b == old_fill)
                    );
                    bytes[new_offset..(new_offset + new_len)].fill(fill);
                    live[idx] = (new_offset, new_len, fill);
                }
                Ok(Resized::Freed(_)) => unreachable!(),
                Err(err) => assert_eq!(err.kind(), ErrorKind::StorageFull),
            }
        }

        check_slots(&bytes, &live);
    }
}

#[test]
fn lock_state_machine() {
    let none = Forbid::empty();

    let excl = lock::acquire(None, LockKind::Exclusive, Forbid::WRITE).unwrap();
    assert_eq!(excl.kind(), LockKind::Exclusive);
    assert_eq!(
        lock::acquire(Some(excl), LockKind::Exclusive, none)
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceBusy
    );
    assert_eq!(
        lock::acquire(Some(excl), LockKind::Shared, Forbid::WRITE)
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceBusy
    );

    // Pack/unpack keeps everything.
    assert_eq!(LockWord::unpack(excl.pack()), Some(excl));
    assert_eq!(LockWord::unpack(0), None);

    // The holder of an exclusive lock may do anything; others may not write.
    lock::check_access(Some(excl), Some(excl.token()), Forbid::WRITE).unwrap();
    lock::check_access(Some(excl), None, Forbid::READ).unwrap();
    assert_eq!(
        lock::check_access(Some(excl), None, Forbid::WRITE)
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceBusy
    );
    assert!(lock::check_access(None, Some(excl.token()), Forbid::READ).is_err());
    assert_eq!(lock::release(Some(excl), excl.token()).unwrap(), None);

    let shared = lock::acquire(None, LockKind::Shared, Forbid::DELETE).unwrap();
    let shared2 = lock::acquire(Some(shared), LockKind::Shared, Forbid::DELETE).unwrap();
    assert_eq!(shared2.holders(), 2);
    assert_eq!(shared.token(), shared2.token());
    assert!(lock::acquire(Some(shared2), LockKind::Shared, Forbid::WRITE).is_err());

    // Shared locks bind their holders, too.
    assert!(lock::check_access(Some(shared2), Some(shared.token()), Forbid::DELETE).is_err());
    lock::check_access(Some(shared2), Some(shared.token()), Forbid::WRITE).unwrap();

    let other = lock::acquire(None, LockKind::Shared, Forbid::DELETE).unwrap();
    assert!(lock::release(Some(shared2), other.token()).is_err());
    let released = lock::release(Some(shared2), shared.token()).unwrap().unwrap();
    assert_eq!(released.holders(), 1);
    assert_eq!(lock::release(Some(released), shared.token()).unwrap(), None);

    // The holder counter saturates.
    let mut word = lock::acquire(None, LockKind::Shared, none).unwrap();
    for _ in 1..MAX_SHARED_HOLDERS {
        word = lock::acquire(Some(word), LockKind::Shared, none).unwrap();
    }
    assert_eq!(word.holders(), MAX_SHARED_HOLDERS);
    assert!(lock::acquire(Some(word), LockKind::Shared, none).is_err());
}

#[test]
fn element_locks() {
    let (_, fs) = new_fs(64, 512);
    let file = fs.root().create_file("f", None).unwrap();
    file.append_content(b"hello", None).unwrap();

    let token = file.lock(LockKind::Exclusive, Forbid::WRITE).unwrap();
    assert_eq!(
        file.lock(LockKind::Exclusive, Forbid::empty())
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceBusy
    );

    // Reads are allowed, writes need the token.
    let mut buf = [0_u8; 5];
    file.get_content(0, &mut buf, None).unwrap();
    assert_eq!(
        file.set_content(0, b"j", None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    assert_eq!(
        file.append_content(b"!", None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    file.set_content(0, b"j", Some(token)).unwrap();
    file.append_content(b"!", Some(token)).unwrap();
    assert_eq!(read_all(&file), b"jello!");
    file.unlock(token).unwrap();
    assert!(file.lock_state().unwrap().is_none());
    assert!(file.unlock(token).is_err());

    let t1 = file.lock(LockKind::Shared, Forbid::DELETE).unwrap();
    let t2 = file.lock(LockKind::Shared, Forbid::DELETE).unwrap();
    assert_eq!(t1, t2);
    assert_eq!(file.lock_state().unwrap().unwrap().holders(), 2);
    assert_eq!(
        file.delete(Some(t1)).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    file.unlock(t1).unwrap();
    file.unlock(t2).unwrap();

    // A locked folder does not take new children.
    let folder = fs.root().create_folder("d", None).unwrap();
    let token = folder.lock(LockKind::Exclusive, Forbid::WRITE).unwrap();
    assert_eq!(
        folder.create_file("x", None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    folder.create_file("x", Some(token)).unwrap();
    let x = folder.get_element_by_name("x", None).unwrap();
    // Nor lets children go.
    assert_eq!(
        x.delete(None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    folder.unlock(token).unwrap();
    x.delete(None).unwrap();

    let meta = file.lock(LockKind::Exclusive, Forbid::META).unwrap();
    assert!(file.set_flags(ElementFlags::HIDDEN, None).is_err());
    assert!(file.rename("g", None).is_err());
    file.set_flags(ElementFlags::HIDDEN, Some(meta)).unwrap();
    file.unlock(meta).unwrap();
}

#[test]
fn content_round_trip() {
    let (_, fs) = new_fs(256, 512);
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    let file = fs.root().create_file("data", None).unwrap();

    let data = random_bytes(&mut rng, 512 * 7 + 123);
    file.append_content(&data, None).unwrap();
    assert_eq!(file.length().unwrap(), data.len() as u64);
    assert_eq!(read_all(&file), data);

    // Unaligned reads and writes across block boundaries.
    let mut buf = vec![0_u8; 1000];
    file.get_content(300, &mut buf, None).unwrap();
    assert_eq!(buf, data[300..1300]);

    let patch = random_bytes(&mut rng, 1500);
    file.set_content(700, &patch, None).unwrap();
    let mut expected = data.clone();
    expected[700..2200].copy_from_slice(&patch);
    assert_eq!(read_all(&file), expected);

    // Many small appends.
    for _ in 0..50 {
        let len = rng.gen_range(1..100);
        let chunk = random_bytes(&mut rng, len);
        file.append_content(&chunk, None).unwrap();
        expected.extend_from_slice(&chunk);
    }
    assert_eq!(read_all(&file), expected);
    assert_eq!(
        file.metadata(None).unwrap().size,
        expected.len() as u64
    );

    file.truncate(1000, None).unwrap();
    expected.truncate(1000);
    assert_eq!(read_all(&file), expected);
    file.truncate(0, None).unwrap();
    assert_eq!(file.length().unwrap(), 0);
    assert!(file.extents().unwrap().is_empty());
}

#[test]
fn idempotence_and_bounds() {
    let (_, fs) = new_fs(64, 512);
    let file = fs.root().create_file("f", None).unwrap();
    file.append_content(&[7_u8; 600], None).unwrap();
    let used = fs.used_blocks().unwrap();
    let modified = file.metadata(None).unwrap().modified;

    file.append_content(&[], None).unwrap();
    file.truncate(600, None).unwrap();
    assert_eq!(file.length().unwrap(), 600);
    assert_eq!(fs.used_blocks().unwrap(), used);
    assert_eq!(file.metadata(None).unwrap().modified, modified);

    let mut buf = [0_u8; 10];
    assert_eq!(
        file.get_content(595, &mut buf, None).unwrap_err().kind(),
        ErrorKind::UnexpectedEof
    );
    assert_eq!(
        file.set_content(591, &buf, None).unwrap_err().kind(),
        ErrorKind::UnexpectedEof
    );
    file.set_content(590, &buf, None).unwrap();
    assert_eq!(
        file.get_content(u64::MAX, &mut buf, None)
            .unwrap_err()
            .kind(),
        ErrorKind::UnexpectedEof
    );
    assert_eq!(
        file.truncate(601, None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );

    // Names.
    let root = fs.root();
    let long = "x".repeat(MAX_NAME_LEN + 1);
    for bad in ["", "a/b", "nul\0", long.as_str()] {
        assert_eq!(
            root.create_file(bad, None).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
    assert_eq!(
        root.create_folder("f", None).unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
    assert_eq!(
        root.get_element_by_name("nope", None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        root.get_element(1, None).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // Wrong kinds.
    assert_eq!(
        fs.lookup("/f/x").unwrap_err().kind(),
        ErrorKind::NotADirectory
    );
    assert_eq!(
        fs.lookup("/").unwrap().into_file().unwrap_err().kind(),
        ErrorKind::IsADirectory
    );
    assert_eq!(
        root.delete(None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        fs.from_id(ElementId::DIRECTORY).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
}

#[test]
fn end_to_end() {
    init_logger();
    let mut rng = rand::rngs::StdRng::seed_from_u64(10_000);
    let dev = MemBlockDevice::new(1024, 4096);
    let fs = FileSystem::format(dev.clone(), 1024).unwrap();
    assert_eq!(fs.block_count(), 1024);
    assert_eq!(fs.block_size(), 4096);
    let free_before = fs.free_blocks().unwrap();
    assert_eq!(free_before, 1024 - 3);

    let a = fs.root().create_folder("a", None).unwrap();
    let b = a.create_file("b.txt", None).unwrap();
    let data = random_bytes(&mut rng, 10_000);
    b.append_content(&data, None).unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    fs.close().unwrap();

    assert_eq!(b.length().unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(fs.used_blocks().unwrap_err().kind(), ErrorKind::NotConnected);

    let fs = FileSystem::open(dev.clone()).unwrap();
    let a = fs.lookup("/a").unwrap().into_folder().unwrap();
    assert_eq!(a.id(), a_id);
    assert_eq!(a.element_count(None).unwrap(), 1);
    let b = fs.lookup("/a/b.txt").unwrap().into_file().unwrap();
    assert_eq!(b.id(), b_id);
    assert_eq!(b.name(None).unwrap(), "b.txt");
    assert_eq!(b.parent().unwrap().unwrap().id(), a_id);

    let mut buf = vec![0_u8; 10_000];
    b.get_content(0, &mut buf, None).unwrap();
    assert_eq!(buf, data);

    assert_eq!(
        a.delete(None).unwrap_err().kind(),
        ErrorKind::DirectoryNotEmpty
    );
    b.delete(None).unwrap();
    a.delete(None).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), free_before);
    assert_eq!(fs.root().element_count(None).unwrap(), 0);
    assert!(fs.engine().live_ids().unwrap().is_empty());
    assert_eq!(b.length().unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn stale_lock_recovery() {
    let (dev, fs) = new_fs(64, 512);
    let file = fs.root().create_file("f", None).unwrap();
    let token = file
        .lock(LockKind::Exclusive, Forbid::WRITE | Forbid::DELETE)
        .unwrap();
    assert_eq!(
        file.append_content(b"x", None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    fs.close().unwrap();

    // Same session start: the lock survives reopening.
    let later = Timestamp::from_nanos(Timestamp::now().as_nanos() + 1_000_000_000);
    let options = FsOptions {
        session_start: Some(fs.session_start()),
        ..Default::default()
    };
    let fs = FileSystem::open_with(dev.clone(), options).unwrap();
    let file = fs.lookup("f").unwrap().into_file().unwrap();
    assert!(file.lock_state().unwrap().is_some());
    fs.close().unwrap();

    // A later session finds the lock abandoned.
    let options = FsOptions {
        session_start: Some(later),
        ..Default::default()
    };
    let fs = FileSystem::open_with(dev, options).unwrap();
    let file = fs.lookup("f").unwrap().into_file().unwrap();
    assert!(file.lock_state().unwrap().is_none());
    file.append_content(b"x", None).unwrap();
    assert_eq!(
        file.unlock(token).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );

    // Locks taken in this session are not stale.
    let token = file.lock(LockKind::Exclusive, Forbid::WRITE).unwrap();
    assert!(file.lock_state().unwrap().is_some());
    assert!(file.append_content(b"y", None).is_err());
    file.unlock(token).unwrap();
}

#[test]
fn relocation() {
    let (dev, fs) = new_fs(256, 512);
    let folder = fs.root().create_folder("many", None).unwrap();
    let first_block = fs.engine().locate(folder.id()).unwrap().block_no;

    let mut ids = Vec::new();
    for idx in 0..40 {
        let file = folder.create_file(&format!("file_{idx}"), None).unwrap();
        file.append_content(format!("content {idx}").as_bytes(), None)
            .unwrap();
        ids.push(file.id());
    }
    // The folder's record outgrew its block.
    assert_ne!(fs.engine().locate(folder.id()).unwrap().block_no, first_block);
    fs.close().unwrap();

    let fs = FileSystem::open(dev).unwrap();
    let folder = fs.lookup("/many").unwrap().into_folder().unwrap();
    assert_eq!(folder.element_count(None).unwrap(), 40);
    for (idx, id) in ids.iter().enumerate() {
        let file = folder
            .get_element(idx as u64, None)
            .unwrap()
            .into_file()
            .unwrap();
        assert_eq!(file.id(), *id);
        assert_eq!(file.name(None).unwrap(), format!("file_{idx}"));
        assert_eq!(read_all(&file), format!("content {idx}").as_bytes());
    }

    let free = fs.free_blocks().unwrap();
    folder.delete_tree(|_| None).unwrap();
    assert!(fs.free_blocks().unwrap() > free);
    assert_eq!(fs.root().element_count(None).unwrap(), 0);
    assert!(fs.engine().live_ids().unwrap().is_empty());
}

#[test]
fn folder_full_rolls_back() {
    let (_, fs) = new_fs(256, 4096);
    let free_before = fs.free_blocks().unwrap();
    let folder = fs.root().create_folder("full", None).unwrap();

    let mut created = 0;
    let err = loop {
        match folder.create_folder(&format!("{created:03}"), None) {
            Ok(_) => created += 1,
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), ErrorKind::StorageFull);
    // A child ID takes 8 bytes of the folder's record.
    assert_eq!(created, (4096 - 4 - 8 - 72 - 8) / 8);
    assert_eq!(folder.element_count(None).unwrap(), created);
    let live = fs.engine().live_ids().unwrap();
    assert_eq!(live.len() as u64, created + 1);

    folder.delete_tree(|_| None).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), free_before);
}

#[test]
fn extent_spill() {
    const BLOCK_SIZE: usize = 4096;
    let (dev, fs) = new_fs(512, BLOCK_SIZE);
    let root = fs.root();
    let a = root.create_file("a", None).unwrap();
    let b = root.create_file("b", None).unwrap();
    let free_before = fs.free_blocks().unwrap();

    // Interleaved appends keep either file from growing in place.
    let mut expected = Vec::new();
    for idx in 0..(INLINE_EXTENTS * 3) {
        let chunk = vec![idx as u8; BLOCK_SIZE];
        a.append_content(&chunk, None).unwrap();
        b.append_content(&chunk, None).unwrap();
        expected.extend_from_slice(&chunk);
    }
    let extents = a.extents().unwrap();
    assert!(extents.len() > INLINE_EXTENTS);
    assert_eq!(read_all(&a), expected);
    fs.close().unwrap();

    let fs = FileSystem::open(dev).unwrap();
    let a = fs.lookup("/a").unwrap().into_file().unwrap();
    assert_eq!(a.extents().unwrap(), extents);
    assert_eq!(read_all(&a), expected);

    // Back to inline extents only.
    a.truncate(BLOCK_SIZE as u64 * 4, None).unwrap();
    assert_eq!(a.extents().unwrap().len(), 4);
    assert_eq!(read_all(&a), expected[..(BLOCK_SIZE * 4)]);

    a.truncate(0, None).unwrap();
    fs.lookup("/b")
        .unwrap()
        .into_file()
        .unwrap()
        .truncate(0, None)
        .unwrap();
    assert_eq!(fs.free_blocks().unwrap(), free_before);
}

#[test]
fn deep_delete() {
    let (_, fs) = new_fs(256, 1024);
    let free_before = fs.free_blocks().unwrap();
    let top = fs.root().create_folder("top", None).unwrap();
    let mut locks = std::collections::HashMap::new();

    let mut folders = vec![top.clone()];
    for depth in 0..4 {
        let mut next = Vec::new();
        for folder in folders.iter() {
            for idx in 0..3 {
                let file = folder.create_file(&format!("f{depth}{idx}"), None).unwrap();
                file.append_content(&[depth as u8; 700], None).unwrap();
            }
            next.push(folder.create_folder(&format!("d{depth}"), None).unwrap());
        }
        folders = next;
    }

    // A locked element stops the whole deletion.
    let victim = fs.lookup("/top/d0/f12").unwrap();
    let token = victim
        .lock(LockKind::Exclusive, Forbid::DELETE)
        .unwrap();
    assert_eq!(
        top.delete_tree(|_| None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    assert_eq!(top.element_count(None).unwrap(), 4);
    assert_eq!(read_all(&fs.lookup("/top/f00").unwrap().into_file().unwrap()).len(), 700);

    locks.insert(victim.id(), token);
    top.delete_tree(|id| locks.get(&id).copied()).unwrap();
    assert_eq!(fs.root().element_count(None).unwrap(), 0);
    assert_eq!(fs.free_blocks().unwrap(), free_before);
    assert!(fs.engine().live_ids().unwrap().is_empty());
}

#[test]
fn move_and_rename() {
    let (dev, fs) = new_fs(128, 512);
    let root = fs.root();
    let src = root.create_folder("src", None).unwrap();
    let dst = root.create_folder("dst", None).unwrap();
    let file = src.create_file("one", None).unwrap();
    file.append_content(b"payload", None).unwrap();

    file.rename("uno", None).unwrap();
    assert_eq!(file.name(None).unwrap(), "uno");
    // Renaming onto itself is a no-op.
    file.rename("uno", None).unwrap();

    src.create_file("two", None).unwrap();
    assert_eq!(
        file.rename("two", None).unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );

    file.move_to(&dst, "moved", None).unwrap();
    assert_eq!(src.element_count(None).unwrap(), 1);
    assert_eq!(dst.element_count(None).unwrap(), 1);
    assert_eq!(file.parent().unwrap().unwrap().id(), dst.id());

    // No cycles.
    let inner = src.create_folder("inner", None).unwrap();
    assert_eq!(
        src.move_to(&inner, "loop", None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        src.move_to(&src, "self", None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    src.move_to(&dst, "src2", None).unwrap();
    assert_eq!(
        root.move_to(&dst, "root", None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    fs.close().unwrap();

    let fs = FileSystem::open(dev).unwrap();
    let moved = fs.lookup("/dst/moved").unwrap().into_file().unwrap();
    assert_eq!(read_all(&moved), b"payload");
    assert!(fs.lookup("/dst/src2/inner").is_ok());
    assert_eq!(fs.root().element_count(None).unwrap(), 1);
}

#[test]
fn links() {
    let (_, fs) = new_fs(64, 512);
    let root = fs.root();
    let docs = root.create_folder("docs", None).unwrap();
    let readme = docs.create_file("readme", None).unwrap();
    readme.append_content(b"read me", None).unwrap();

    let link = root.create_link("shortcut", &readme, None).unwrap();
    let meta = link.metadata(None).unwrap();
    assert_eq!(meta.kind, ElementKind::Link);
    assert!(meta.flags.contains(ElementFlags::LINK | ElementFlags::FILE));
    let target = link.target(None).unwrap().into_file().unwrap();
    assert_eq!(read_all(&target), b"read me");

    assert_eq!(
        root.create_link("bad", &link, None).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        root.add_child("bad", ElementKind::Link, None, None)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidInput
    );

    link.set_target(&docs, None).unwrap();
    let flags = link.metadata(None).unwrap().flags;
    assert!(flags.contains(ElementFlags::FOLDER));
    assert!(!flags.contains(ElementFlags::FILE));

    // Links to folders are followed inside paths.
    let found = fs.lookup("/shortcut/readme").unwrap();
    assert_eq!(found.id(), readme.id());
    assert_eq!(
        fs.lookup("/shortcut").unwrap().element_kind(),
        ElementKind::Link
    );

    docs.delete_tree(|_| None).unwrap();
    assert_eq!(link.target(None).unwrap_err().kind(), ErrorKind::NotFound);
    link.delete(None).unwrap();
}

#[test]
fn metadata_and_flags() {
    let (_, fs) = new_fs(64, 512);
    let file = fs.root().create_file("f", None).unwrap();
    let before = file.metadata(None).unwrap();
    assert_eq!(before.kind, ElementKind::File);
    assert_eq!(before.size, 0);
    assert!(before.created <= before.modified);

    file.set_flags(ElementFlags::EXECUTABLE | ElementFlags::FOLDER, None)
        .unwrap();
    let after = file.metadata(None).unwrap();
    // Kind flags cannot be changed.
    assert_eq!(after.flags, ElementFlags::FILE | ElementFlags::EXECUTABLE);
    assert!(after.meta_modified >= before.meta_modified);
    assert_eq!(after.modified, before.modified);

    file.append_content(b"abc", None).unwrap();
    assert!(file.metadata(None).unwrap().modified >= after.modified);
    assert_eq!(fs.root().metadata(None).unwrap().size, 1);
    assert_eq!(fs.root().name(None).unwrap(), "");
    assert!(fs.root().parent().unwrap().is_none());
}

#[test]
fn rename_touches_parent() {
    let (_, fs) = new_fs(64, 512);
    let folder = fs.root().create_folder("d", None).unwrap();
    let file = folder.create_file("old", None).unwrap();
    let before = folder.metadata(None).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(2));
    file.rename("new", None).unwrap();
    let after = folder.metadata(None).unwrap();
    assert!(after.modified > before.modified);
    assert!(after.meta_modified > before.meta_modified);
    assert_eq!(after.size, 1);
}

#[test]
fn link_to_reused_id_dangles() {
    let (dev, fs) = new_fs(64, 512);
    let root = fs.root();
    let a = root.create_file("a", None).unwrap();
    let link = root.create_link("l", &a, None).unwrap();
    let old_id = a.id();
    a.delete(None).unwrap();

    // The new folder gets the deleted file's ID.
    let x = root.create_folder("x", None).unwrap();
    assert_eq!(x.id(), old_id);
    x.create_file("inner", None).unwrap();

    assert_eq!(link.target(None).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        link.target_id(None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        fs.lookup("/l/inner").unwrap_err().kind(),
        ErrorKind::NotFound
    );
    let flags = link.metadata(None).unwrap().flags;
    assert!(flags.contains(ElementFlags::FILE));

    link.set_target(&x, None).unwrap();
    assert_eq!(link.target_id(None).unwrap(), x.id());
    fs.close().unwrap();

    // The stamp is stored with the link.
    let fs = FileSystem::open(dev).unwrap();
    let inner = fs.lookup("/l/inner").unwrap();
    assert_eq!(inner.element_kind(), ElementKind::File);
}

#[test]
fn read_lock_blocks_listing() {
    let (_, fs) = new_fs(64, 512);
    let root = fs.root();
    let folder = root.create_folder("d", None).unwrap();
    folder.create_file("f", None).unwrap();
    let link = root.create_link("l", &folder, None).unwrap();
    let busy = ErrorKind::ResourceBusy;

    let token = folder.lock(LockKind::Exclusive, Forbid::READ).unwrap();
    assert_eq!(folder.element_count(None).unwrap_err().kind(), busy);
    assert_eq!(folder.get_element(0, None).unwrap_err().kind(), busy);
    assert_eq!(folder.get_element_by_name("f", None).unwrap_err().kind(), busy);
    assert_eq!(folder.children(None).unwrap_err().kind(), busy);
    assert_eq!(folder.metadata(None).unwrap_err().kind(), busy);
    assert_eq!(folder.name(None).unwrap_err().kind(), busy);
    assert_eq!(fs.lookup("/d/f").unwrap_err().kind(), busy);

    assert_eq!(folder.element_count(Some(token)).unwrap(), 1);
    let child = folder.get_element(0, Some(token)).unwrap();
    assert_eq!(child.name(None).unwrap(), "f");
    let by_name = folder.get_element_by_name("f", Some(token)).unwrap();
    assert_eq!(by_name.id(), child.id());
    assert_eq!(folder.children(Some(token)).unwrap().len(), 1);
    assert_eq!(folder.name(Some(token)).unwrap(), "d");
    folder.unlock(token).unwrap();
    assert_eq!(fs.lookup("/d/f").unwrap().id(), child.id());

    let token = link.lock(LockKind::Exclusive, Forbid::READ).unwrap();
    assert_eq!(link.target(None).unwrap_err().kind(), busy);
    assert_eq!(link.target_id(None).unwrap_err().kind(), busy);
    assert_eq!(link.target_id(Some(token)).unwrap(), folder.id());
    link.unlock(token).unwrap();
    assert_eq!(link.target(None).unwrap().id(), folder.id());
}

#[test]
fn failed_structural_change_rolls_back() {
    let (_, fs) = new_fs(64, 512);
    let root = fs.root();
    let file = root.create_file("keep", None).unwrap();
    file.append_content(&[7_u8; 1500], None).unwrap();
    let engine = fs.engine();
    let free = fs.free_blocks().unwrap();
    let live = engine.live_ids().unwrap();

    // Completed steps are undone when a later one fails.
    let err = engine
        .structural(|engine| {
            engine.add_child(root.id(), "ghost", ElementKind::Folder, None, None)?;
            engine.add_child(root.id(), "ghost2", ElementKind::File, None, None)?;
            Err::<(), std::io::Error>(ErrorKind::Other.into())
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Other);
    assert_eq!(fs.free_blocks().unwrap(), free);
    assert_eq!(engine.live_ids().unwrap(), live);
    assert_eq!(root.element_count(None).unwrap(), 1);
    assert_eq!(fs.lookup("/ghost").unwrap_err().kind(), ErrorKind::NotFound);

    // With one of its blocks already free, the delete fails only after the
    // parent listing and the directory have been rewritten.
    let extent = file.extents().unwrap()[0];
    {
        let _guard = engine.lock_structure().unwrap();
        engine.ranges().free(extent).unwrap();
    }
    assert_eq!(
        file.delete(None).unwrap_err().kind(),
        ErrorKind::InvalidData
    );
    assert_eq!(root.element_count(None).unwrap(), 1);
    assert_eq!(fs.lookup("/keep").unwrap().id(), file.id());
    assert_eq!(file.length().unwrap(), 1500);
    assert_eq!(file.name(None).unwrap(), "keep");
    assert!(engine.live_ids().unwrap().contains(&file.id()));
}

#[test]
fn directory_reuses_ids() {
    let (_, fs) = new_fs(64, 512);
    let root = fs.root();
    let a = root.create_file("a", None).unwrap();
    let b = root.create_file("b", None).unwrap();
    let c = root.create_file("c", None).unwrap();
    assert_eq!(a.id().as_u64(), 2);
    assert_eq!(c.id().as_u64(), 4);

    b.delete(None).unwrap();
    let d = root.create_file("d", None).unwrap();
    assert_eq!(d.id(), b.id());
    assert_eq!(
        fs.engine().live_ids().unwrap(),
        vec![a.id(), d.id(), c.id()]
    );

    c.delete(None).unwrap();
    d.delete(None).unwrap();
    assert_eq!(fs.engine().live_ids().unwrap(), vec![a.id()]);
    assert_eq!(
        fs.from_id(c.id()).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn streams() {
    let (_, fs) = new_fs(64, 512);
    let file = fs.root().create_file("log", None).unwrap();

    let mut stream = file
        .open_stream(LockKind::Exclusive, Forbid::WRITE)
        .unwrap();
    assert_eq!(
        file.append_content(b"x", None).unwrap_err().kind(),
        ErrorKind::ResourceBusy
    );
    stream.write_all(b"hello, world").unwrap();
    stream.seek(SeekFrom::Start(7)).unwrap();
    stream.write_all(b"there, friend").unwrap();
    stream.seek(SeekFrom::End(2)).unwrap();
    stream.write_all(b"!").unwrap();
    assert!(stream.seek(SeekFrom::Current(-100)).is_err());

    stream.seek(SeekFrom::Start(0)).unwrap();
    let mut text = Vec::new();
    stream.read_to_end(&mut text).unwrap();
    assert_eq!(text, b"hello, there, friend\0\0!");
    drop(stream);

    // The stream's lock went away with it.
    assert!(file.lock_state().unwrap().is_none());
    let mut reader = file.stream(None);
    let mut buf = [0_u8; 5];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(reader.position(), 5);
}

#[test]
fn concurrent_threads() {
    let (_, fs) = new_fs(2048, 1024);
    let mut threads = Vec::new();
    for idx in 0..6_u8 {
        let fs = fs.clone();
        threads.push(std::thread::spawn(move || {
            let folder = fs.root().create_folder(&format!("t{idx}"), None).unwrap();
            let file = folder.create_file("data", None).unwrap();
            let mut expected = Vec::new();
            for step in 0..40 {
                let chunk = vec![idx.wrapping_mul(31).wrapping_add(step); 100 + step as usize];
                file.append_content(&chunk, None).unwrap();
                expected.extend_from_slice(&chunk);
                let token = file.lock(LockKind::Shared, Forbid::DELETE).unwrap();
                assert_eq!(read_all(&file), expected);
                file.unlock(token).unwrap();
            }
            file.set_content(10, &[idx; 10], None).unwrap();
            expected[10..20].fill(idx);
            assert_eq!(read_all(&file), expected);
            (folder.id(), expected)
        }));
    }

    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(fs.root().element_count(None).unwrap(), 6);
    for (idx, (id, expected)) in results.iter().enumerate() {
        let folder = fs.from_id(*id).unwrap().into_folder().unwrap();
        assert_eq!(folder.name(None).unwrap(), format!("t{idx}"));
        let file = folder.get_element(0, None).unwrap().into_file().unwrap();
        assert_eq!(&read_all(&file), expected);
    }

    let engine = fs.engine();
    for block_no in 0..fs.block_count() {
        assert_eq!(engine.store.pin_count(block_no), 0);
    }
    assert_eq!(engine.store.monitor_count(), 0);
}

#[test]
fn block_store() {
    init_logger();
    let dev = MemBlockDevice::new(16, 512);
    let store = crate::block_store::BlockStore::new(Box::new(dev.clone()), 2);

    {
        let mut block = store.pin(5).unwrap();
        block.bytes_mut()[0..3].copy_from_slice(b"abc");
        let again = store.pin(5).unwrap();
        assert_eq!(store.pin_count(5), 2);
        assert_eq!(&again.bytes()[0..3], b"abc");
    }
    assert_eq!(store.pin_count(5), 0);

    // Evicted dirty blocks are written back.
    for block_no in 6..10 {
        drop(store.pin(block_no).unwrap());
    }
    let mut buf = vec![0_u8; 512];
    dev.clone().read_block(5, &mut buf).unwrap();
    assert_eq!(&buf[0..3], b"abc");

    {
        let mut block = store.pin_empty(7).unwrap();
        block.bytes_mut()[0] = 1;
    }
    store.discard_all();
    dev.clone().read_block(7, &mut buf).unwrap();
    assert_eq!(buf[0], 0);

    let m1 = store.monitor(3);
    let m2 = store.monitor(3);
    assert!(Arc::ptr_eq(&m1, &m2));
    assert_eq!(store.monitor_count(), 1);
    drop((m1, m2));
    assert_eq!(store.monitor_count(), 0);

    {
        let mut block = store.pin(8).unwrap();
        block.bytes_mut()[0] = 9;
    }
    store.close().unwrap();
    assert_eq!(store.pin(1).err().unwrap().kind(), ErrorKind::NotConnected);
    assert!(store.save_all().is_err());
    dev.clone().read_block(8, &mut buf).unwrap();
    assert_eq!(buf[0], 9);
}

#[test]
fn free_slot_returns_empty_blocks() {
    let (_, fs) = new_fs(64, 512);
    let engine = fs.engine();
    let _guard = engine.lock_structure().unwrap();
    let used = engine.ranges().used_blocks().unwrap();

    let loc = engine.alloc_in_fresh_block(100).unwrap();
    let other = engine.alloc_slot_near(loc.block_no, 50).unwrap();
    assert_eq!(other.block_no, loc.block_no);
    assert_eq!(engine.ranges().used_blocks().unwrap(), used + 1);

    assert_eq!(engine.free_slot(loc, 100).unwrap(), Freed::Slot);
    assert_eq!(engine.free_slot(other, 50).unwrap(), Freed::Block);
    assert_eq!(engine.ranges().used_blocks().unwrap(), used);
    assert_eq!(
        engine
            .alloc_in_fresh_block(engine.max_slot_len() + 1)
            .unwrap_err()
            .kind(),
        ErrorKind::StorageFull
    );
}

#[test]
fn resize_slot_to_zero_returns_empty_blocks() {
    let (_, fs) = new_fs(64, 512);
    let engine = fs.engine();
    let _guard = engine.lock_structure().unwrap();
    let used = engine.ranges().used_blocks().unwrap();

    let loc = engine.alloc_in_fresh_block(100).unwrap();
    let other = engine.alloc_slot_near(loc.block_no, 50).unwrap();
    assert_eq!(engine.ranges().used_blocks().unwrap(), used + 1);

    assert_eq!(
        engine.resize_slot(loc, 100, 40).unwrap(),
        Resized::At(loc.offset)
    );
    assert_eq!(
        engine.resize_slot(loc, 40, 0).unwrap(),
        Resized::Freed(Freed::Slot)
    );
    assert_eq!(engine.ranges().used_blocks().unwrap(), used + 1);
    assert_eq!(
        engine.resize_slot(other, 50, 0).unwrap(),
        Resized::Freed(Freed::Block)
    );
    assert_eq!(engine.ranges().used_blocks().unwrap(), used);
}

#[test]
fn format_and_open_errors() {
    init_logger();
    let dev = MemBlockDevice::new(16, 512);
    assert_eq!(
        FileSystem::format(dev.clone(), 3).err().unwrap().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        FileSystem::format(dev.clone(), 17).err().unwrap().kind(),
        ErrorKind::InvalidInput
    );
    assert_eq!(
        FileSystem::format(MemBlockDevice::new(16, 256), 16)
            .err()
            .unwrap()
            .kind(),
        ErrorKind::InvalidInput
    );

    // Nothing there yet.
    assert_eq!(
        FileSystem::open(dev.clone()).err().unwrap().kind(),
        ErrorKind::InvalidData
    );

    let fs = FileSystem::format(dev.clone(), 12).unwrap();
    assert_eq!(fs.block_count(), 12);
    fs.close().unwrap();
    assert_eq!(fs.close().unwrap_err().kind(), ErrorKind::NotConnected);

    let fs = FileSystem::open(dev.clone()).unwrap();
    assert_eq!(fs.block_count(), 12);
    assert_eq!(fs.free_blocks().unwrap(), 9);
    fs.close().unwrap();

    // A damaged superblock is detected.
    let mut buf = vec![0_u8; 512];
    let mut raw = dev.clone();
    raw.read_block(0, &mut buf).unwrap();
    buf[20] ^= 0xff;
    raw.write_block(0, &buf).unwrap();
    assert_eq!(
        FileSystem::open(dev).err().unwrap().kind(),
        ErrorKind::InvalidData
    );
}

#[test]
fn file_block_device() {
    init_logger();
    const NUM_BLOCKS: u64 = 64;
    let path = std::env::temp_dir().join("slotfs_dev_basic");
    std::fs::remove_file(path.clone()).ok();

    let dev = file_block_device::FileBlockDevice::create(&path, NUM_BLOCKS, 1024).unwrap();
    let fs = FileSystem::format(dev, NUM_BLOCKS).unwrap();
    let file = fs.root().create_file("hello.txt", None).unwrap();
    file.append_content(b"hello from a host file", None).unwrap();
    fs.close().unwrap();

    let dev = file_block_device::FileBlockDevice::open(&path, 1024).unwrap();
    let fs = FileSystem::open(dev).unwrap();
    let file = fs.lookup("/hello.txt").unwrap().into_file().unwrap();
    assert_eq!(read_all(&file), b"hello from a host file");
    fs.close().unwrap();

    std::fs::remove_file(path).ok();
}
