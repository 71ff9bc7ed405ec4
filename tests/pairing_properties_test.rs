//! Pairing map properties under long random operation sequences, from one
//! thread and from several at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use companion_link::{ClientMappingDatabase, DeviceId, PairingError, PairingEvent, RemoteId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Replays events onto a plain model of the map.
#[derive(Default)]
struct Model {
    by_device: HashMap<DeviceId, RemoteId>,
}

impl Model {
    fn apply(&mut self, event: &PairingEvent) {
        match event {
            PairingEvent::Assigned { device, client } => {
                assert!(
                    !self.by_device.values().any(|c| c == client),
                    "client assigned twice without release"
                );
                assert!(
                    self.by_device.insert(device.clone(), *client).is_none(),
                    "device assigned without release"
                );
            }
            PairingEvent::Released { device, client } => {
                assert_eq!(self.by_device.remove(device), Some(*client), "release of unknown edge");
            }
        }
    }
}

fn assert_bijective(map: &ClientMappingDatabase, devices: &[DeviceId], clients: &[RemoteId]) {
    for device in devices {
        if let Some(client) = map.try_get_client(device) {
            assert_eq!(map.try_get_device(client).as_ref(), Some(device));
        }
    }
    for client in clients {
        if let Some(device) = map.try_get_device(*client) {
            assert_eq!(map.try_get_client(&device), Some(*client));
        }
    }
}

#[test]
fn test_random_operations_keep_one_to_one_pairing() {
    let map = ClientMappingDatabase::new();
    let devices: Vec<DeviceId> = (0..4).map(|i| DeviceId::new(format!("Actor{i}"))).collect();
    let clients: Vec<RemoteId> = (0..5).map(|_| RemoteId::new()).collect();

    let log = Arc::new(Mutex::new(Vec::new()));
    let log_ref = Arc::clone(&log);
    map.subscribe(move |event| log_ref.lock().unwrap().push(event.clone()));

    let mut model = Model::default();
    // Fixed seed so failures reproduce.
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..2000 {
        let device = devices[rng.random_range(0..devices.len())].clone();
        let client = clients[rng.random_range(0..clients.len())];
        let before = map.try_get_client(&device);

        match rng.random_range(0..5) {
            0 => {
                map.set_client(&device, None, false).unwrap();
                assert!(map.try_get_client(&device).is_none());
            }
            1 | 2 => {
                let replace = rng.random_bool(0.5);
                match map.set_client(&device, Some(client), replace) {
                    Ok(()) => {
                        assert_eq!(map.try_get_client(&device), Some(client));
                        assert_eq!(map.try_get_device(client), Some(device.clone()));
                    }
                    Err(PairingError::Conflict { current, .. }) => {
                        assert!(!replace);
                        assert_eq!(before, Some(current));
                        assert_ne!(current, client);
                        assert_eq!(map.try_get_client(&device), before, "conflict changes nothing");
                    }
                    Err(e @ PairingError::ClientRemoved { .. }) => panic!("no client was retired: {e}"),
                }
            }
            3 => {
                map.remove_client(client);
                assert!(map.try_get_device(client).is_none());
            }
            _ => {
                map.remove_device(&device);
                assert!(map.try_get_client(&device).is_none());
            }
        }

        assert_bijective(&map, &devices, &clients);
        for event in log.lock().unwrap().drain(..) {
            model.apply(&event);
        }
        let mut pairs = map.pairings();
        pairs.sort();
        let mut modelled: Vec<(DeviceId, RemoteId)> =
            model.by_device.iter().map(|(d, c)| (d.clone(), *c)).collect();
        modelled.sort();
        assert_eq!(pairs, modelled, "events replay to the same map");
    }
}

#[test]
fn test_idempotent_assignment_emits_nothing() {
    let map = ClientMappingDatabase::new();
    let device = DeviceId::from("Actor1");
    let client = RemoteId::new();

    let count = Arc::new(Mutex::new(0));
    let count_ref = Arc::clone(&count);
    map.subscribe(move |_| *count_ref.lock().unwrap() += 1);

    map.set_client(&device, Some(client), false).unwrap();
    map.set_client(&device, Some(client), false).unwrap();
    map.set_client(&device, Some(client), true).unwrap();

    assert_eq!(*count.lock().unwrap(), 1);
}

/// No client appears on two devices in one snapshot.
fn assert_snapshot_one_to_one(pairs: &[(DeviceId, RemoteId)]) {
    let mut clients = HashSet::new();
    for (device, client) in pairs {
        assert!(clients.insert(*client), "client {client} on two devices, one is {device}");
    }
}

#[test]
fn test_concurrent_writers_deliver_events_in_edge_order() {
    let map = ClientMappingDatabase::new();
    let devices: Vec<DeviceId> = (0..4).map(|i| DeviceId::new(format!("Actor{i}"))).collect();
    let clients: Vec<RemoteId> = (0..4).map(|_| RemoteId::new()).collect();

    let log = Arc::new(Mutex::new(Vec::new()));
    let log_ref = Arc::clone(&log);
    map.subscribe(move |event| log_ref.lock().unwrap().push(event.clone()));

    let writing = AtomicBool::new(true);
    std::thread::scope(|scope| {
        let writers: Vec<_> = (0..4u64)
            .map(|worker| {
                let (map, devices, clients) = (&map, &devices, &clients);
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0x5eed + worker);
                    for _ in 0..500 {
                        let device = &devices[rng.random_range(0..devices.len())];
                        let client = clients[rng.random_range(0..clients.len())];
                        match rng.random_range(0..4) {
                            0 => {
                                map.remove_client(client);
                            }
                            1 => {
                                map.remove_device(device);
                            }
                            _ => {
                                let _ = map.set_client(device, Some(client), rng.random_bool(0.5));
                            }
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2 {
            let (map, clients, writing) = (&map, &clients, &writing);
            scope.spawn(move || {
                while writing.load(Ordering::Acquire) {
                    assert_snapshot_one_to_one(&map.pairings());
                    for client in clients {
                        let _ = map.try_get_device(*client);
                    }
                }
            });
        }

        for writer in writers {
            writer.join().unwrap();
        }
        writing.store(false, Ordering::Release);
    });

    // Replaying delivered events in order rebuilds exactly the final map.
    let mut model = Model::default();
    for event in log.lock().unwrap().iter() {
        model.apply(event);
    }
    let mut modelled: Vec<(DeviceId, RemoteId)> =
        model.by_device.iter().map(|(d, c)| (d.clone(), *c)).collect();
    modelled.sort();
    let mut pairs = map.pairings();
    pairs.sort();
    assert_eq!(pairs, modelled);
    assert_snapshot_one_to_one(&pairs);
}

