//! Anonymous memory: zero-filled on first touch.

use crate::Result;

use super::{FaultContext, Resolution};

pub(super) fn page_fault(ctx: &FaultContext<'_>) -> Result<Resolution> {
    let frame = ctx.commit(|frame| ctx.frames.zero_frame(frame))?;
    log::trace!("anonymous page {} backed by {frame:?}", ctx.page);
    Ok(Resolution {
        frame,
        tracked: true,
    })
}
