use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use marquee_bus::{ConnectionId, DeliveryError, DestinationFlags, MessageBus, Recipient};
use marquee_ipc::Envelope;
use proptest::prelude::*;

#[derive(Default)]
struct Counter {
    hits: AtomicUsize,
}

impl Recipient for Counter {
    fn deliver(&self, _envelope: &Envelope) -> Result<(), DeliveryError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Operation {
    Add { slot: u8, flags: u8 },
    Remove { slot: u8 },
    Dispatch { filter: u8 },
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        (0u8..6, 0u8..16).prop_map(|(slot, flags)| Operation::Add { slot, flags }),
        (0u8..6).prop_map(|slot| Operation::Remove { slot }),
        (0u8..16).prop_map(|filter| Operation::Dispatch { filter }),
    ]
}

proptest! {
    #[test]
    fn registered_listeners_receive_exactly_matching_events(
        ops in prop::collection::vec(operation_strategy(), 1..64)
    ) {
        let bus = MessageBus::new();
        let slots: Vec<(ConnectionId, Arc<Counter>)> = (0..6)
            .map(|_| (ConnectionId::next(), Arc::new(Counter::default())))
            .collect();
        let mut registered: BTreeMap<u8, u8> = BTreeMap::new();
        let mut expected = [0usize; 6];

        for op in ops {
            match op {
                Operation::Add { slot, flags } => {
                    let (connection, counter) = &slots[slot as usize];
                    bus.add_listener(
                        *connection,
                        DestinationFlags::from_bits(flags as u32),
                        counter.clone(),
                    );
                    registered.insert(slot, flags);
                }
                Operation::Remove { slot } => {
                    let removed = bus.remove_listener(slots[slot as usize].0);
                    prop_assert_eq!(removed, registered.remove(&slot).is_some());
                }
                Operation::Dispatch { filter } => {
                    let report = bus.dispatch("tick", "", DestinationFlags::from_bits(filter as u32));
                    let mut delivered = 0;
                    for (slot, flags) in &registered {
                        if flags & filter != 0 {
                            expected[*slot as usize] += 1;
                            delivered += 1;
                        }
                    }
                    prop_assert_eq!(report.delivered, delivered);
                    prop_assert_eq!(report.delivered + report.skipped, registered.len());
                }
            }
            prop_assert_eq!(bus.listener_count(), registered.len());
        }

        for (index, (_, counter)) in slots.iter().enumerate() {
            prop_assert_eq!(counter.hits.load(Ordering::SeqCst), expected[index]);
        }
    }
}

#[test]
fn stable_listeners_see_every_dispatch_under_churn() {
    let bus = Arc::new(MessageBus::new());
    let stable: Vec<Arc<Counter>> = (0..4).map(|_| Arc::new(Counter::default())).collect();
    for counter in &stable {
        bus.add_listener(ConnectionId::next(), DestinationFlags::ALL, counter.clone());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let churn = {
        let bus = Arc::clone(&bus);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let connection = ConnectionId::next();
                bus.add_listener(
                    connection,
                    DestinationFlags::WORKER,
                    Arc::new(Counter::default()),
                );
                bus.remove_listener(connection);
            }
        })
    };

    let dispatchers: Vec<_> = (0..3)
        .map(|_| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for _ in 0..200 {
                    bus.dispatch("tick", "", DestinationFlags::ALL);
                }
            })
        })
        .collect();
    for dispatcher in dispatchers {
        dispatcher.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    churn.join().unwrap();

    for counter in &stable {
        assert_eq!(counter.hits.load(Ordering::SeqCst), 600);
    }
    assert_eq!(bus.listener_count(), 4);
}
