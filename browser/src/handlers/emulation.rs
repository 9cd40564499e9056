use crate::BrowserError;
use crate::Result;
use crate::handlers::parse;
use crate::registry::SessionRegistry;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetGeolocationOverrideParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetLocaleOverrideParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::emulation::SetTouchEmulationEnabledParams;
use chromiumoxide::cdp::browser_protocol::network::EmulateNetworkConditionsParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

/// Named device presets: width, height, device scale factor, mobile,
/// user agent. The latest emulation call wins; re-emulating a desktop
/// profile is the reset.
struct DevicePreset {
    name: &'static str,
    width: u32,
    height: u32,
    scale: f64,
    mobile: bool,
    user_agent: &'static str,
}

const DEVICE_PRESETS: &[DevicePreset] = &[
    DevicePreset {
        name: "iPhone 13",
        width: 390,
        height: 844,
        scale: 3.0,
        mobile: true,
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1",
    },
    DevicePreset {
        name: "iPhone SE",
        width: 375,
        height: 667,
        scale: 2.0,
        mobile: true,
        user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1",
    },
    DevicePreset {
        name: "Pixel 7",
        width: 412,
        height: 915,
        scale: 2.625,
        mobile: true,
        user_agent: "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    },
    DevicePreset {
        name: "iPad Mini",
        width: 768,
        height: 1024,
        scale: 2.0,
        mobile: true,
        user_agent: "Mozilla/5.0 (iPad; CPU OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1",
    },
    DevicePreset {
        name: "Desktop 1080p",
        width: 1920,
        height: 1080,
        scale: 1.0,
        mobile: false,
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    },
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmulateDeviceParams {
    session_id: String,
    device: String,
}

pub async fn emulate_device(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: EmulateDeviceParams = parse(params)?;
    let preset = DEVICE_PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(&body.device))
        .ok_or_else(|| {
            let known: Vec<&str> = DEVICE_PRESETS.iter().map(|p| p.name).collect();
            BrowserError::InvalidRequest(format!(
                "unknown device \"{}\"; known devices: {}",
                body.device,
                known.join(", ")
            ))
        })?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;
    let page = session.page().cdp();

    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(preset.width as i64)
        .height(preset.height as i64)
        .device_scale_factor(preset.scale)
        .mobile(preset.mobile)
        .build()
        .map_err(BrowserError::CdpError)?;
    page.execute(metrics).await?;

    let ua = SetUserAgentOverrideParams::builder()
        .user_agent(preset.user_agent)
        .build()
        .map_err(BrowserError::CdpError)?;
    page.execute(ua).await?;

    let touch = SetTouchEmulationEnabledParams::builder()
        .enabled(preset.mobile)
        .build()
        .map_err(BrowserError::CdpError)?;
    page.execute(touch).await?;

    Ok(json!({
        "device": preset.name,
        "viewport": { "width": preset.width, "height": preset.height },
        "mobile": preset.mobile,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeolocationParams {
    session_id: String,
    latitude: f64,
    longitude: f64,
    #[serde(default = "default_accuracy")]
    accuracy: f64,
}

fn default_accuracy() -> f64 {
    1.0
}

pub async fn geolocation(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: GeolocationParams = parse(params)?;
    if !(-90.0..=90.0).contains(&body.latitude) || !(-180.0..=180.0).contains(&body.longitude) {
        return Err(BrowserError::InvalidRequest(
            "latitude/longitude out of range".to_string(),
        ));
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    // Grant the permission browser-side first or the override never surfaces
    // to page script. Best-effort: older browsers lack the command.
    if let Err(e) = session
        .transport()
        .send(
            "Browser.grantPermissions",
            json!({ "permissions": ["geolocation"] }),
        )
        .await
    {
        debug!("grantPermissions failed: {e}");
    }

    let params = SetGeolocationOverrideParams::builder()
        .latitude(body.latitude)
        .longitude(body.longitude)
        .accuracy(body.accuracy)
        .build();
    session.page().cdp().execute(params).await?;
    Ok(json!({ "latitude": body.latitude, "longitude": body.longitude }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimezoneParams {
    session_id: String,
    timezone_id: String,
}

pub async fn timezone(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: TimezoneParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    session
        .page()
        .cdp()
        .execute(SetTimezoneOverrideParams {
            timezone_id: body.timezone_id.clone(),
        })
        .await?;
    Ok(json!({ "timezoneId": body.timezone_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocaleParams {
    session_id: String,
    locale: String,
}

pub async fn locale(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: LocaleParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    let params = SetLocaleOverrideParams::builder()
        .locale(&body.locale)
        .build();
    session.page().cdp().execute(params).await?;
    Ok(json!({ "locale": body.locale }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineParams {
    session_id: String,
    offline: bool,
}

pub async fn offline(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: OfflineParams = parse(params)?;
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    // -1 disables throttling; only connectivity is being emulated.
    let params = EmulateNetworkConditionsParams::builder()
        .offline(body.offline)
        .latency(0.0)
        .download_throughput(-1.0)
        .upload_throughput(-1.0)
        .build()
        .map_err(BrowserError::CdpError)?;
    session.page().cdp().execute(params).await?;
    Ok(json!({ "offline": body.offline }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadersParams {
    session_id: String,
    headers: serde_json::Map<String, Value>,
}

pub async fn headers(registry: &SessionRegistry, params: Value) -> Result<Value> {
    let body: HeadersParams = parse(params)?;
    for value in body.headers.values() {
        if !value.is_string() {
            return Err(BrowserError::InvalidRequest(
                "header values must be strings".to_string(),
            ));
        }
    }
    let session = registry.get(&body.session_id).await?;
    let _guard = session.lock_actions().await?;

    session
        .page()
        .execute_cdp_raw(
            "Network.setExtraHTTPHeaders",
            json!({ "headers": body.headers }),
        )
        .await?;
    Ok(json!({ "headers": body.headers.len() }))
}
