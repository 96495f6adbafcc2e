use std::collections::BTreeMap;
use std::sync::Arc;

use gfxhost_cdma::{CdmaHw, HostGeneration, RecordingCdmaHw};
use gfxhost_channel::{ChannelConfig, Gather, Host, HostConfig, JobBuilder};
use gfxhost_syncpt::Fence;
use proptest::prelude::*;

const CLASS: u32 = 0x60;

#[derive(Debug, Clone)]
struct GatherShape {
    offset_words: u32,
    words: u32,
    pre_fence: Option<u32>,
    class: bool,
}

fn gather_shape() -> impl Strategy<Value = GatherShape> {
    (0u32..4, 1u32..=4, prop::option::of(1u32..20), any::<bool>()).prop_map(
        |(offset_words, words, pre_fence, class)| GatherShape {
            offset_words,
            words,
            pre_fence,
            class,
        },
    )
}

// syncpoint id -> (increments, wait base)
fn increments() -> impl Strategy<Value = BTreeMap<u32, (u32, Option<u32>)>> {
    prop::collection::btree_map(1u32..8, (1u32..4, prop::option::of(0u32..4)), 1..4)
}

proptest! {
    #[test]
    fn receipt_words_match_what_reaches_the_ring(
        v2 in any::<bool>(),
        serialize in any::<bool>(),
        null_kickoff in any::<bool>(),
        incrs in increments(),
        gathers in prop::collection::vec(gather_shape(), 0..6),
    ) {
        let generation = if v2 { HostGeneration::V2 } else { HostGeneration::V1 };
        let hw = Arc::new(RecordingCdmaHw::new());
        let config = HostConfig {
            syncpts: 8,
            generation,
            push_buffer_words: 128,
            channels: vec![ChannelConfig::new("gr3d", CLASS)],
            ..HostConfig::default()
        };
        let host = Host::with_hw(config, |_, _, _| hw.clone() as Arc<dyn CdmaHw>).unwrap();
        let buf = host.memory().alloc(8).unwrap();

        let mut builder = JobBuilder::new().serialize(serialize).null_kickoff(null_kickoff);
        for (&id, &(count, base)) in &incrs {
            builder = match base {
                Some(base) => builder.incr_with_base(id, count, base),
                None => builder.incr(id, count),
            };
        }
        for shape in &gathers {
            let mut gather = Gather::new(&buf, shape.offset_words * 4, shape.words);
            if let Some(thresh) = shape.pre_fence {
                gather = gather.after(Fence::new(7, thresh));
            }
            if shape.class {
                gather = gather.class(CLASS);
            }
            builder = builder.gather_with(gather);
        }
        let job = builder.build();
        let expected = job.ring_words(generation.ops());

        let receipt = host.submit(0, job).unwrap();
        prop_assert_eq!(receipt.words, expected);
        let cdma = host.channel(0).unwrap().cdma();
        prop_assert_eq!(cdma.put().wrapping_sub(receipt.ring_start), expected);
        if null_kickoff {
            prop_assert_eq!(expected, 0);
            prop_assert!(hw.kicks().is_empty());
        } else {
            prop_assert_eq!(hw.kicks(), vec![expected]);
        }
    }
}
