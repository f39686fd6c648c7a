use std::sync::Arc;
use std::time::Duration;

use tessera_gpu::Error;
use tessera_gpu::buffer::StorageMode;
use tessera_gpu::device::soft::{DeviceEvent, Progress, SoftDevice};
use tessera_gpu::ring::{RingAllocator, RingConfig};
use tessera_gpu::sync::{ByteRange, LockConfig};

const ATOM: u64 = 16;
const STRIDE: u64 = 256;

fn lock_config(max_timeouts: Option<u32>) -> LockConfig {
    LockConfig {
        long_timeout: Duration::from_micros(10),
        max_timeouts,
        ..LockConfig::default()
    }
}

/// Three-atom ring whose atoms 0 and 1 hold data the device has not consumed.
fn busy_ring(
    progress: Progress,
    max_timeouts: Option<u32>,
) -> (Arc<SoftDevice>, RingAllocator<SoftDevice>) {
    let device = Arc::new(SoftDevice::with_alignment(256));
    device.set_progress(progress);
    let config = RingConfig {
        lock: lock_config(max_timeouts),
        ..RingConfig::new(3, ATOM)
    };
    let mut ring = RingAllocator::with_config(device.clone(), config).unwrap();

    let mut data = vec![b'A'; ATOM as usize];
    data.extend_from_slice(&[b'B'; ATOM as usize]);
    ring.upload(&data, 2).unwrap();
    ring.bind_current(0, 2).unwrap();
    ring.on_usage_complete().unwrap();

    assert_eq!(ring.head(), 2);
    assert_eq!(device.last_fence_seq(), 1);
    (device, ring)
}

// ── busy device ───────────────────────────────────────────────────────────

#[test]
fn wrapping_map_blocks_on_fence_covering_reused_atoms() {
    let (device, mut ring) = busy_ring(Progress::Stalled, Some(3));

    let err = ring.map(2).err().unwrap();

    match err {
        Error::FenceTimeout { range, timeouts } => {
            assert_eq!(range, ByteRange::new(0, 2 * STRIDE));
            assert_eq!(timeouts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    // one poll, then three long waits
    assert_eq!(device.waits_on(1), 4);
    assert!(ring.is_poisoned());
}

#[test]
fn wrapping_map_proceeds_once_the_device_catches_up() {
    let (device, mut ring) = busy_ring(Progress::AfterTimeouts(2), None);
    device.take_events();

    let mut writer = ring.map(2).unwrap();
    writer.write_atom(0, &[b'C'; 16]).unwrap();
    writer.unmap().unwrap();

    assert_eq!(ring.head(), 0);
    assert_eq!(device.waits_on(1), 4);
    assert_eq!(device.completed_seq(), 1);
    assert!(ring.locks().is_empty());

    let contents = device.contents(ring.buffer().handle().unwrap()).unwrap();
    assert_eq!(&contents[..16], &[b'C'; 16]);
}

#[test]
fn unused_atom_is_handed_out_without_waiting() {
    let (device, mut ring) = busy_ring(Progress::Stalled, Some(1));
    device.take_events();

    let mut writer = ring.map(1).unwrap();
    writer.write_atom(0, &[b'C'; 16]).unwrap();
    writer.unmap().unwrap();

    assert_eq!(device.waits_on(1), 0);
    assert!(!device.events().iter().any(|e| matches!(e, DeviceEvent::FenceWaited { .. })));
    assert_eq!(ring.locks().len(), 1);

    ring.on_usage_complete().unwrap();
    assert_eq!(ring.head(), 0);
    assert_eq!(ring.locks().len(), 2);
}

#[test]
fn gpu_driven_ring_never_blocks_the_cpu() {
    let device = Arc::new(SoftDevice::with_alignment(256));
    device.set_progress(Progress::Stalled);
    let config = RingConfig {
        storage: StorageMode::Orphaning,
        lock: LockConfig::gpu_driven(),
        ..RingConfig::new(2, ATOM)
    };
    let mut ring = RingAllocator::with_config(device.clone(), config).unwrap();

    for frame in 0..6u8 {
        ring.upload(&[frame; 16], 1).unwrap();
        ring.on_usage_complete().unwrap();
    }

    let events = device.events();
    assert!(!events.iter().any(|e| matches!(e, DeviceEvent::FenceWaited { .. })));
    let blocks = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::DeviceBlocked { .. }))
        .count();
    assert_eq!(blocks, 4);
}

#[test]
fn rings_sharing_a_device_only_wait_on_their_own_fences() {
    let device = Arc::new(SoftDevice::with_alignment(256));
    let mut first = RingAllocator::with_config(device.clone(), RingConfig::new(1, ATOM)).unwrap();
    let mut second = RingAllocator::with_config(device.clone(), RingConfig::new(1, ATOM)).unwrap();

    first.upload(&[1; 16], 1).unwrap();
    first.on_usage_complete().unwrap();
    second.upload(&[2; 16], 1).unwrap();
    second.on_usage_complete().unwrap();

    first.map(1).unwrap().unmap().unwrap();

    assert!(device.waits_on(1) > 0);
    assert_eq!(device.waits_on(2), 0);
    assert_eq!(second.locks().len(), 1);
}

// ── randomized hazard check ───────────────────────────────────────────────

/// Linear congruential generator, for reproducible sequences.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, bound: u32) -> u32 {
        self.next() % bound
    }
}

fn run_sequence(seed: u64, storage: StorageMode) {
    let mut rng = Lcg(seed);
    let num_atoms = 2 + rng.below(9);
    let device = Arc::new(SoftDevice::with_alignment(256));
    let config = RingConfig {
        storage,
        ..RingConfig::new(num_atoms, ATOM)
    };
    let mut ring = RingAllocator::with_config(device.clone(), config).unwrap();

    for step in 0..200u32 {
        let count = 1 + rng.below(num_atoms);
        let head = ring.head();
        let start = if head + count > num_atoms { 0 } else { head };
        let range = ByteRange::atoms(start, count, STRIDE);

        let mut writer = ring.map(count).unwrap();
        for atom in 0..count {
            writer.write_atom(atom, &[step as u8; 16]).unwrap();
        }
        writer.unmap().unwrap();

        let hazards = device.unretired_reads(ring.buffer().handle().unwrap(), range);
        assert!(
            hazards.is_empty(),
            "seed {seed} step {step}: wrote {range} while the device still reads {hazards:?}"
        );

        ring.bind_current(rng.below(4), count).unwrap();
        ring.on_usage_complete().unwrap();

        // The device runs behind by a random amount.
        if rng.below(3) == 0 {
            let last = device.last_fence_seq();
            let lag = u64::from(rng.below(4));
            device.retire_through(last.saturating_sub(lag));
        }
    }
}

#[test]
fn randomized_sequences_never_write_memory_in_use() {
    for seed in 1..=24u64 {
        run_sequence(seed, StorageMode::PersistentMapped);
        run_sequence(seed * 7919, StorageMode::Orphaning);
    }
}
