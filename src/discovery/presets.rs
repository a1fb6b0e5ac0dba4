//! The preset library: named `SetConfig` fragments the engine walks
//! through. Phase 1 holds the baseline sentinel, the two payload flavors
//! and one representative per family; phase 2 holds the parameter sweeps;
//! phase 3 is composed at runtime from whatever won.

use serde::Serialize;

use crate::config::{
    FakePayload, FakingStrategy, IncomingMode, SetConfig, ShuffleMode, Strategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Family {
    TcpFrag,
    TlsRec,
    Oob,
    FakeSni,
    IpFrag,
    Sack,
    Desync,
    SynFake,
    Delay,
}

pub const ALL_FAMILIES: [Family; 9] = [
    Family::TcpFrag,
    Family::TlsRec,
    Family::Oob,
    Family::FakeSni,
    Family::IpFrag,
    Family::Sack,
    Family::Desync,
    Family::SynFake,
    Family::Delay,
];

#[derive(Debug, Clone)]
pub struct Preset {
    pub name: String,
    pub family: Family,
    pub phase: u8,
    pub set: SetConfig,
}

impl Preset {
    fn new(name: &str, family: Family, phase: u8, build: impl FnOnce(&mut SetConfig)) -> Self {
        let mut set = SetConfig::named("main", name);
        build(&mut set);
        Self {
            name: name.to_string(),
            family,
            phase,
            set,
        }
    }
}

pub const BASELINE: &str = "no-bypass";
pub const PAYLOAD_PROBE: &str = "proven-combo";
pub const PAYLOAD_PROBE_ALT: &str = "proven-combo-alt";

fn proven_combo(set: &mut SetConfig) {
    set.fragmentation.strategy = Strategy::Combo;
    set.fragmentation.middle_sni = true;
    set.faking.sni = true;
    set.faking.ttl = 8;
    set.faking.strategy = FakingStrategy::Pastseq;
}

pub fn phase1() -> Vec<Preset> {
    vec![
        // sentinel: transformations disabled entirely
        Preset::new(BASELINE, Family::TcpFrag, 1, |set| {
            set.enabled = false;
        }),
        // the two decoy payload flavors, tested early to pick one
        Preset::new(PAYLOAD_PROBE, Family::FakeSni, 1, |set| {
            proven_combo(set);
            set.faking.payload = FakePayload::Google;
        }),
        Preset::new(PAYLOAD_PROBE_ALT, Family::FakeSni, 1, |set| {
            proven_combo(set);
            set.faking.payload = FakePayload::Duckduckgo;
        }),
        // one representative per family
        Preset::new("tcpfrag-pos1", Family::TcpFrag, 1, |set| {
            set.fragmentation.strategy = Strategy::Tcp;
            set.fragmentation.sni_position = 1;
        }),
        Preset::new("tlsrec-midsni", Family::TlsRec, 1, |set| {
            set.fragmentation.strategy = Strategy::Tcp;
            set.fragmentation.middle_sni = true;
        }),
        Preset::new("oob-pos1", Family::Oob, 1, |set| {
            set.fragmentation.strategy = Strategy::Oob;
            set.fragmentation.oob_position = 1;
        }),
        Preset::new("fakesni-ttl8", Family::FakeSni, 1, |set| {
            set.faking.sni = true;
            set.faking.ttl = 8;
            set.faking.strategy = FakingStrategy::Pastseq;
        }),
        Preset::new("ipfrag-paced", Family::IpFrag, 1, |set| {
            set.fragmentation.strategy = Strategy::Tcp;
            set.fragmentation.sni_position = 64;
            set.tcp.seg2_delay_ms = 10;
        }),
        Preset::new("sack-decoy", Family::Sack, 1, |set| {
            set.fragmentation.strategy = Strategy::Sack;
            set.faking.ttl = 8;
        }),
        Preset::new("desync-disorder", Family::Desync, 1, |set| {
            set.fragmentation.strategy = Strategy::Disorder;
            set.fragmentation.middle_sni = true;
        }),
        Preset::new("synfake-ttl8", Family::SynFake, 1, |set| {
            set.fragmentation.strategy = Strategy::Synfake;
            set.faking.ttl = 8;
        }),
        Preset::new("delay-50", Family::Delay, 1, |set| {
            set.fragmentation.strategy = Strategy::Delay;
            set.tcp.seg2_delay_ms = 50;
        }),
    ]
}

pub fn phase2(family: Family) -> Vec<Preset> {
    match family {
        Family::TcpFrag => vec![
            Preset::new("tcpfrag-pos2", Family::TcpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.sni_position = 2;
            }),
            Preset::new("tcpfrag-pos4", Family::TcpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.sni_position = 4;
            }),
            Preset::new("tcpfrag-midsni", Family::TcpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
            }),
            Preset::new("tcpfrag-reverse", Family::TcpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
                set.fragmentation.reverse_order = true;
            }),
            Preset::new("tcpfrag-reverse-delay", Family::TcpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
                set.fragmentation.reverse_order = true;
                set.tcp.seg2_delay_ms = 20;
            }),
        ],
        Family::TlsRec => vec![
            Preset::new("tlsrec-delay10", Family::TlsRec, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
                set.tcp.seg2_delay_ms = 10;
            }),
            Preset::new("tlsrec-delay30", Family::TlsRec, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
                set.tcp.seg2_delay_ms = 30;
            }),
            Preset::new("tlsrec-reverse", Family::TlsRec, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
                set.fragmentation.reverse_order = true;
            }),
        ],
        Family::Oob => vec![
            Preset::new("oob-pos2", Family::Oob, 2, |set| {
                set.fragmentation.strategy = Strategy::Oob;
                set.fragmentation.oob_position = 2;
            }),
            Preset::new("oob-midsni", Family::Oob, 2, |set| {
                set.fragmentation.strategy = Strategy::Oob;
                set.fragmentation.middle_sni = true;
            }),
            Preset::new("oob-reverse", Family::Oob, 2, |set| {
                set.fragmentation.strategy = Strategy::Oob;
                set.fragmentation.middle_sni = true;
                set.fragmentation.reverse_order = true;
            }),
        ],
        Family::FakeSni => vec![
            Preset::new("fakesni-ttl3", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 3;
                set.faking.strategy = FakingStrategy::Pastseq;
            }),
            Preset::new("fakesni-ttl5", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 5;
                set.faking.strategy = FakingStrategy::Pastseq;
            }),
            Preset::new("fakesni-badsum", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 8;
                set.faking.strategy = FakingStrategy::Badsum;
            }),
            Preset::new("fakesni-badseq", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 8;
                set.faking.strategy = FakingStrategy::Badseq;
            }),
            Preset::new("fakesni-all", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 8;
                set.faking.strategy = FakingStrategy::All;
            }),
            Preset::new("fakesni-frag", Family::FakeSni, 2, |set| {
                set.faking.sni = true;
                set.faking.ttl = 8;
                set.faking.strategy = FakingStrategy::Pastseq;
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.middle_sni = true;
            }),
        ],
        Family::IpFrag => vec![
            Preset::new("ipfrag-paced5", Family::IpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.sni_position = 64;
                set.tcp.seg2_delay_ms = 5;
            }),
            Preset::new("ipfrag-paced20", Family::IpFrag, 2, |set| {
                set.fragmentation.strategy = Strategy::Tcp;
                set.fragmentation.sni_position = 64;
                set.tcp.seg2_delay_ms = 20;
            }),
        ],
        Family::Sack => vec![
            Preset::new("sack-x1", Family::Sack, 2, |set| {
                set.fragmentation.strategy = Strategy::Sack;
                set.faking.fake_count = 1;
            }),
            Preset::new("sack-x3", Family::Sack, 2, |set| {
                set.fragmentation.strategy = Strategy::Sack;
                set.faking.fake_count = 3;
            }),
            Preset::new("sack-x5", Family::Sack, 2, |set| {
                set.fragmentation.strategy = Strategy::Sack;
                set.faking.fake_count = 5;
            }),
        ],
        Family::Desync => vec![
            Preset::new("desync-full", Family::Desync, 2, |set| {
                set.fragmentation.strategy = Strategy::Disorder;
                set.fragmentation.middle_sni = true;
                set.fragmentation.disorder.shuffle_mode = ShuffleMode::Full;
            }),
            Preset::new("desync-reverse", Family::Desync, 2, |set| {
                set.fragmentation.strategy = Strategy::Disorder;
                set.fragmentation.middle_sni = true;
                set.fragmentation.disorder.shuffle_mode = ShuffleMode::Reverse;
            }),
            Preset::new("desync-post-rst", Family::Desync, 2, |set| {
                set.fragmentation.strategy = Strategy::Disorder;
                set.fragmentation.middle_sni = true;
                set.tcp.post_desync_rst = true;
            }),
            Preset::new("desync-incoming", Family::Desync, 2, |set| {
                set.fragmentation.strategy = Strategy::Disorder;
                set.fragmentation.middle_sni = true;
                set.tcp.incoming.mode = IncomingMode::Desync;
            }),
        ],
        Family::SynFake => vec![
            Preset::new("synfake-ttl3", Family::SynFake, 2, |set| {
                set.fragmentation.strategy = Strategy::Synfake;
                set.faking.ttl = 3;
            }),
            Preset::new("synfake-ttl5", Family::SynFake, 2, |set| {
                set.fragmentation.strategy = Strategy::Synfake;
                set.faking.ttl = 5;
            }),
        ],
        Family::Delay => vec![
            Preset::new("delay-20", Family::Delay, 2, |set| {
                set.fragmentation.strategy = Strategy::Delay;
                set.tcp.seg2_delay_ms = 20;
            }),
            Preset::new("delay-100", Family::Delay, 2, |set| {
                set.fragmentation.strategy = Strategy::Delay;
                set.tcp.seg2_delay_ms = 100;
            }),
        ],
    }
}

/// Pairwise combinations of the winning parameters: the fragmentation of
/// one family layered with the faking/timing of the other.
pub fn combinations(best: &[(Family, Preset)]) -> Vec<Preset> {
    let mut out = Vec::new();
    for (i, (fam_a, a)) in best.iter().enumerate() {
        for (fam_b, b) in best.iter().skip(i + 1) {
            let name = format!("combo-{}-{}", slug(*fam_a), slug(*fam_b));
            let mut set = SetConfig::named("main", &name);

            // fragmentation comes from whichever side fragments; faking
            // and the tcp knobs merge with the other side
            set.fragmentation = a.set.fragmentation.clone();
            if set.fragmentation.strategy == Strategy::None {
                set.fragmentation = b.set.fragmentation.clone();
            }
            set.faking = if b.set.faking.sni {
                b.set.faking.clone()
            } else {
                a.set.faking.clone()
            };
            set.tcp.seg2_delay_ms = a.set.tcp.seg2_delay_ms.max(b.set.tcp.seg2_delay_ms);
            set.tcp.post_desync_rst = a.set.tcp.post_desync_rst || b.set.tcp.post_desync_rst;

            out.push(Preset {
                name,
                family: *fam_a,
                phase: 3,
                set,
            });
        }
    }
    out
}

fn slug(family: Family) -> &'static str {
    match family {
        Family::TcpFrag => "tcpfrag",
        Family::TlsRec => "tlsrec",
        Family::Oob => "oob",
        Family::FakeSni => "fakesni",
        Family::IpFrag => "ipfrag",
        Family::Sack => "sack",
        Family::Desync => "desync",
        Family::SynFake => "synfake",
        Family::Delay => "delay",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase1_opens_with_the_sentinels() {
        let presets = phase1();
        assert_eq!(presets[0].name, BASELINE);
        assert!(!presets[0].set.enabled);
        assert_eq!(presets[1].name, PAYLOAD_PROBE);
        assert_eq!(presets[2].name, PAYLOAD_PROBE_ALT);
        assert_eq!(presets[1].set.faking.payload, FakePayload::Google);
        assert_eq!(presets[2].set.faking.payload, FakePayload::Duckduckgo);
    }

    #[test]
    fn phase1_covers_every_family() {
        let presets = phase1();
        for family in ALL_FAMILIES {
            assert!(
                presets.iter().any(|p| p.family == family),
                "{family:?} missing from phase 1"
            );
        }
    }

    #[test]
    fn every_family_has_phase2_presets() {
        for family in ALL_FAMILIES {
            let presets = phase2(family);
            assert!(!presets.is_empty(), "{family:?} has no phase-2 presets");
            assert!(presets.iter().all(|p| p.phase == 2));
            assert!(presets.iter().all(|p| p.family == family));
        }
    }

    #[test]
    fn preset_names_are_unique() {
        let mut names: Vec<String> = phase1().into_iter().map(|p| p.name).collect();
        for family in ALL_FAMILIES {
            names.extend(phase2(family).into_iter().map(|p| p.name));
        }
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn combinations_merge_fragmentation_and_faking() {
        let frag = phase2(Family::TcpFrag).remove(2); // tcpfrag-midsni
        let fake = phase2(Family::FakeSni).remove(0); // fakesni-ttl3
        let combos = combinations(&[(Family::TcpFrag, frag), (Family::FakeSni, fake)]);

        assert_eq!(combos.len(), 1);
        let combo = &combos[0];
        assert_eq!(combo.name, "combo-tcpfrag-fakesni");
        assert_eq!(combo.phase, 3);
        assert_eq!(combo.set.fragmentation.strategy, Strategy::Tcp);
        assert!(combo.set.faking.sni);
        assert_eq!(combo.set.faking.ttl, 3);
    }

    #[test]
    fn three_families_give_three_pairs() {
        let best: Vec<(Family, Preset)> = [Family::TcpFrag, Family::Oob, Family::FakeSni]
            .into_iter()
            .map(|f| (f, phase2(f).remove(0)))
            .collect();
        assert_eq!(combinations(&best).len(), 3);
    }
}
