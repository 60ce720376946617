// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use super::gpu::ModeInfo;

/// Pick the timing to drive a connector with.
///
/// Any mode the connector flags as preferred wins outright. Otherwise the
/// largest active area wins, with refresh rate deciding between equal
/// areas and the connector-reported order deciding exact ties.
pub fn find_best_mode<M: ModeInfo + Clone>(modes: &[M]) -> Option<M> {
    if let Some(mode) = modes.iter().find(|mode| mode.is_preferred()) {
        return Some(mode.clone());
    }

    let mut best: Option<&M> = None;
    for mode in modes {
        let better = match best {
            None => true,
            Some(current) => {
                mode.area() > current.area()
                    || (mode.area() == current.area() && mode.refresh() > current.refresh())
            }
        };
        if better {
            best = Some(mode);
        }
    }
    best.cloned()
}

/// Find a free CRTC one of the connector's encoders can drive.
///
/// Bit `i` of an encoder mask refers to the `i`-th entry of the device's
/// CRTC array, so iteration is positional over `crtcs` rather than over
/// whatever order the free set yields.
pub fn find_crtc_for_connector<C: Copy + Eq + Hash>(
    crtcs: &[C],
    free_crtcs: &HashSet<C>,
    encoder_masks: &[u32],
) -> Option<C> {
    for mask in encoder_masks {
        for (index, crtc) in crtcs.iter().enumerate().take(32) {
            if mask & (1 << index) != 0 && free_crtcs.contains(crtc) {
                return Some(*crtc);
            }
        }
    }
    None
}

pub fn refresh_interval(refresh: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(refresh.max(1)))
}
