//! Property tests for local track toggles

#![allow(clippy::unwrap_used)]

mod common;

use common::Harness;
use peercall_core::CallRole;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn enabled_flags_follow_toggle_parity(toggles in proptest::collection::vec(any::<bool>(), 0..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (audio, video) = rt.block_on(async {
            let mut h = Harness::new(CallRole::Initiator);
            h.session.start().await.unwrap();
            for audio in &toggles {
                if *audio {
                    h.session.toggle_audio().unwrap();
                } else {
                    h.session.toggle_video().unwrap();
                }
            }
            let state = (h.session.is_audio_enabled(), h.session.is_video_enabled());
            h.session.end().await;
            state
        });

        let audio_toggles = toggles.iter().filter(|a| **a).count();
        let video_toggles = toggles.len() - audio_toggles;
        prop_assert_eq!(audio, audio_toggles % 2 == 0);
        prop_assert_eq!(video, video_toggles % 2 == 0);
    }
}

#[tokio::test]
async fn toggles_without_media_do_nothing() {
    let mut h = Harness::new(CallRole::Responder);
    assert_eq!(h.session.toggle_audio(), None);
    assert_eq!(h.session.toggle_video(), None);
    assert!(!h.session.is_audio_enabled());
}

#[tokio::test]
async fn double_toggle_restores_state() {
    let mut h = Harness::new(CallRole::Responder);
    h.session.start().await.unwrap();
    assert_eq!(h.session.toggle_audio(), Some(false));
    assert_eq!(h.session.toggle_audio(), Some(true));
    assert_eq!(h.session.toggle_video(), Some(false));
    assert_eq!(h.session.toggle_video(), Some(true));
    assert!(h.session.is_audio_enabled() && h.session.is_video_enabled());
}
