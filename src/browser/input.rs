//! Raw input synthesis over CDP.
//!
//! Element-level `click`/`type_str` cover form filling; these helpers
//! cover the cases that need page-absolute coordinates (coordinate
//! CAPTCHA replay) or a bare key press (query submission).

use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::Page;

use crate::error::{CoreError, Result};

/// Synthesise a left click at page-absolute coordinates.
pub async fn click_at(page: &Page, x: f64, y: f64) -> Result<()> {
    let moved = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseMoved)
        .x(x)
        .y(y)
        .build()
        .map_err(CoreError::Replay)?;
    page.execute(moved).await?;

    let pressed = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MousePressed)
        .x(x)
        .y(y)
        .button(MouseButton::Left)
        .click_count(1)
        .build()
        .map_err(CoreError::Replay)?;
    page.execute(pressed).await?;

    let released = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseReleased)
        .x(x)
        .y(y)
        .button(MouseButton::Left)
        .click_count(1)
        .build()
        .map_err(CoreError::Replay)?;
    page.execute(released).await?;
    Ok(())
}

/// Press Enter in the focused element.
pub async fn press_enter(page: &Page) -> Result<()> {
    let down = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyDown)
        .key("Enter")
        .code("Enter")
        .text("\r")
        .windows_virtual_key_code(13)
        .native_virtual_key_code(13)
        .build()
        .map_err(CoreError::Replay)?;
    page.execute(down).await?;

    let up = DispatchKeyEventParams::builder()
        .r#type(DispatchKeyEventType::KeyUp)
        .key("Enter")
        .code("Enter")
        .windows_virtual_key_code(13)
        .native_virtual_key_code(13)
        .build()
        .map_err(CoreError::Replay)?;
    page.execute(up).await?;
    Ok(())
}
