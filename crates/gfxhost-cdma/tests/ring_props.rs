use std::collections::VecDeque;
use std::sync::Arc;

use gfxhost_cdma::{Cdma, CdmaError, NullCdmaHw};
use gfxhost_syncpt::{Fence, SyncptRegistry};
use proptest::prelude::*;

const CAPACITY: u32 = 32;

#[derive(Debug, Clone)]
enum Step {
    Commit(Vec<u32>),
    Abandon { reserve: u32, pushed: u32 },
    Complete,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => prop::collection::vec(any::<u32>(), 0..=CAPACITY as usize).prop_map(Step::Commit),
        1 => (1..=CAPACITY, 0..=CAPACITY).prop_map(|(reserve, pushed)| Step::Abandon {
            reserve,
            pushed: pushed.min(reserve),
        }),
        2 => Just(Step::Complete),
    ]
}

struct Committed {
    start: u32,
    words: Vec<u32>,
    thresh: u32,
}

proptest! {
    #[test]
    fn space_tracks_uncompleted_transactions(steps in prop::collection::vec(step(), 1..64)) {
        let registry = Arc::new(SyncptRegistry::new(2));
        let cdma = Cdma::new("props", CAPACITY, Arc::new(NullCdmaHw::new()), registry.clone()).unwrap();
        let sp = registry.get(1).unwrap();
        let mut model: VecDeque<Committed> = VecDeque::new();

        for step in steps {
            match step {
                Step::Commit(words) => {
                    let len = words.len() as u32;
                    if cdma.space() < len {
                        continue;
                    }
                    let mut txn = cdma.begin(len).unwrap();
                    let start = txn.start();
                    txn.push_all(&words).unwrap();
                    let thresh = sp.increment_max(1);
                    let put = txn.end(vec![Fence::new(1, thresh)]);
                    prop_assert_eq!(put, start.wrapping_add(len));
                    model.push_back(Committed { start, words, thresh });
                }
                Step::Abandon { reserve, pushed } => {
                    if cdma.space() < reserve {
                        continue;
                    }
                    let put = cdma.put();
                    let mut txn = cdma.begin(reserve).unwrap();
                    prop_assert!(matches!(cdma.begin(1), Err(CdmaError::Busy)));
                    for word in 0..pushed {
                        txn.push(word).unwrap();
                    }
                    let overrun = vec![0; (reserve - pushed + 1) as usize];
                    prop_assert!(txn.push_all(&overrun).is_err());
                    drop(txn);
                    prop_assert_eq!(cdma.put(), put);
                    prop_assert!(!cdma.snapshot().open);
                }
                Step::Complete => {
                    let Some(oldest) = model.pop_front() else {
                        continue;
                    };
                    // Nothing committed later may have overwritten it.
                    prop_assert_eq!(cdma.dump(oldest.start, oldest.words.len() as u32), oldest.words);
                    sp.advance_current(oldest.thresh);
                    prop_assert_eq!(cdma.update(), 1);
                }
            }

            let outstanding: u32 = model.iter().map(|c| c.words.len() as u32).sum();
            prop_assert_eq!(cdma.space(), CAPACITY - outstanding);
            prop_assert_eq!(cdma.in_flight(), model.len());
        }
    }
}
