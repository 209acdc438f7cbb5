//! Challenge-token generator.
//!
//! Each request may carry an opaque `x-client-transaction-id` header derived
//! from two keys scraped off the web client: the site-verification byte
//! vector and an animation key interpolated out of an SVG loading curve.
//! Algorithm reconstructed from the web client's obfuscated script; see
//! https://antibot.blog/posts/1741552025433 for the write-up.

use base64::Engine;
use rand::Rng;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::account::random_user_agent;
use crate::error::{Error, Result};

/// Any web-client page carries the keys; a profile page is stable enough.
const KEY_PAGE_URL: &str = "https://x.com/tesla";

/// Epoch the web client subtracts before signing timestamps.
const TS_EPOCH_MS: i64 = 1_682_924_400_000;

const DEFAULT_KEYWORD: &str = "obfiowerehiring";
const DEFAULT_RANDOM_NUM: u8 = 3;

fn keys_err(msg: &str) -> Error {
    Error::ChallengeKeys(msg.to_string())
}

fn make_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(random_user_agent())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}

/// Fetches a page, following the web client's JS redirect hop and the
/// `x/migrate` form post when they appear.
async fn page_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let rep = client.get(url).send().await?.error_for_status()?;
    let text = rep.text().await?;
    if !text.contains(">document.location =") {
        return Ok(text);
    }

    let url = text
        .split("document.location = \"")
        .nth(1)
        .and_then(|x| x.split('"').next())
        .ok_or_else(|| keys_err("bad document.location redirect"))?
        .to_string();

    let rep = client.get(&url).send().await?.error_for_status()?;
    let text = rep.text().await?;
    if !text.contains("action=\"https://x.com/x/migrate\" method=\"post\"") {
        return Ok(text);
    }

    let form = parse_migrate_form(&text);
    let rep = client
        .post("https://x.com/x/migrate")
        .json(&form)
        .send()
        .await?
        .error_for_status()?;
    Ok(rep.text().await?)
}

fn parse_migrate_form(text: &str) -> serde_json::Map<String, Value> {
    let doc = Html::parse_document(text);
    let sel = Selector::parse("input[name]").expect("static selector");

    let mut form = serde_json::Map::new();
    for el in doc.select(&sel) {
        if let (Some(name), Some(value)) = (el.value().attr("name"), el.value().attr("value")) {
            form.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    form
}

fn script_urls(text: &str) -> Result<Vec<String>> {
    let blob = text
        .split("e=>e+\".\"+")
        .nth(1)
        .and_then(|x| x.split("[e]+\"a.js\"").next())
        .ok_or_else(|| keys_err("couldn't locate scripts map"))?;

    let map: serde_json::Map<String, Value> =
        serde_json::from_str(blob).map_err(|_| keys_err("failed to parse scripts map"))?;

    Ok(map
        .iter()
        .filter_map(|(k, v)| {
            v.as_str().map(|v| {
                format!("https://abs.twimg.com/responsive-web/client-web/{k}.{v}a.js")
            })
        })
        .collect())
}

fn parse_vk_bytes(text: &str) -> Result<Vec<u8>> {
    let doc = Html::parse_document(text);
    let sel = Selector::parse("meta[name='twitter-site-verification']").expect("static selector");
    let content = doc
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .ok_or_else(|| keys_err("couldn't get site verification key bytes"))?;

    base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|_| keys_err("site verification key is not base64"))
}

/// Byte indices are buried in the `ondemand.s` script as `(x[NN], 16)`
/// parse calls.
async fn parse_anim_idx(client: &reqwest::Client, text: &str) -> Result<Vec<usize>> {
    let scripts = script_urls(text)?;
    let script = scripts
        .iter()
        .find(|x| x.contains("/ondemand.s."))
        .ok_or_else(|| keys_err("couldn't get ondemand script"))?;

    let text = page_text(client, script).await?;

    let re = Regex::new(r"\(\w\[(\d{1,2})\],\s*16\)").expect("static regex");
    let items: Vec<usize> = re
        .captures_iter(&text)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect();
    if items.is_empty() {
        return Err(keys_err("couldn't get key byte indices"));
    }
    Ok(items)
}

/// Rows of the chosen `loading-x-anim` SVG path, split on its curve
/// commands.
fn parse_anim_arr(text: &str, vk_bytes: &[u8]) -> Result<Vec<Vec<f64>>> {
    let doc = Html::parse_document(text);
    let sel = Selector::parse("svg[id^='loading-x-anim'] g:first-child path:nth-child(2)")
        .expect("static selector");

    let els: Vec<String> = doc
        .select(&sel)
        .filter_map(|el| el.value().attr("d").map(|d| d.trim().to_string()))
        .collect();
    if els.is_empty() {
        return Err(keys_err("couldn't get animation paths"));
    }

    let key = *vk_bytes.get(5).ok_or_else(|| keys_err("key bytes too short"))? as usize;
    let el = &els[key % els.len()];
    let data = el.get(9..).ok_or_else(|| keys_err("animation path too short"))?;

    let re = Regex::new(r"[^\d]+").expect("static regex");
    let rows = data
        .split('C')
        .map(|x| {
            re.replace_all(x, " ")
                .split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect()
        })
        .collect();
    Ok(rows)
}

/// Cubic bezier solved by bisection, matching the web client's easing.
struct Cubic {
    curves: Vec<f64>,
}

impl Cubic {
    fn get_value(&self, time: f64) -> f64 {
        let c = &self.curves;
        let (mut start, mut end, mut mid) = (0.0f64, 1.0f64, 0.0f64);

        if time <= 0.0 {
            let start_gradient = if c[0] > 0.0 {
                c[1] / c[0]
            } else if c[1] == 0.0 && c[2] > 0.0 {
                c[3] / c[2]
            } else {
                0.0
            };
            return start_gradient * time;
        }

        if time >= 1.0 {
            let end_gradient = if c[2] < 1.0 {
                (c[3] - 1.0) / (c[2] - 1.0)
            } else if c[2] == 1.0 && c[0] < 1.0 {
                (c[1] - 1.0) / (c[0] - 1.0)
            } else {
                0.0
            };
            return 1.0 + end_gradient * (time - 1.0);
        }

        while start < end {
            mid = (start + end) / 2.0;
            let x_est = Self::calculate(c[0], c[2], mid);
            if (time - x_est).abs() < 0.00001 {
                return Self::calculate(c[1], c[3], mid);
            }
            if x_est < time {
                start = mid;
            } else {
                end = mid;
            }
        }
        Self::calculate(c[1], c[3], mid)
    }

    fn calculate(a: f64, b: f64, m: f64) -> f64 {
        3.0 * a * (1.0 - m) * (1.0 - m) * m + 3.0 * b * (1.0 - m) * m * m + m * m * m
    }
}

fn interpolate(from: &[f64], to: &[f64], f: f64) -> Vec<f64> {
    from.iter()
        .zip(to.iter())
        .map(|(a, b)| a * (1.0 - f) + b * f)
        .collect()
}

fn rotation_matrix(rotation: f64) -> [f64; 4] {
    let rad = rotation.to_radians();
    [rad.cos(), -rad.sin(), rad.sin(), rad.cos()]
}

fn solve(value: f64, min_val: f64, max_val: f64, rounding: bool) -> f64 {
    let result = value * (max_val - min_val) / 255.0 + min_val;
    if rounding {
        result.floor()
    } else {
        (result * 100.0).round() / 100.0
    }
}

/// Hex rendering with a fractional part, the way the web client formats
/// matrix values (not std's `{:x}`, which only does integers).
fn float_to_hex(x: f64) -> String {
    let mut result: Vec<String> = Vec::new();
    let mut quotient = x as i64;
    let fraction = x - quotient as f64;
    let mut x = x;

    while quotient > 0 {
        quotient = (x / 16.0) as i64;
        let remainder = (x - (quotient as f64) * 16.0) as i64;
        if remainder > 9 {
            result.insert(0, char::from((remainder + 55) as u8).to_string());
        } else {
            result.insert(0, remainder.to_string());
        }
        x = quotient as f64;
    }

    if fraction == 0.0 {
        return result.join("");
    }

    result.push(".".to_string());
    let mut fraction = fraction;
    while fraction > 0.0 {
        fraction *= 16.0;
        let integer = fraction as i64;
        fraction -= integer as f64;
        if integer > 9 {
            result.push(char::from((integer + 55) as u8).to_string());
        } else {
            result.push(integer.to_string());
        }
    }

    result.join("")
}

fn calc_anim_key(frames: &[f64], target_time: f64) -> Result<String> {
    if frames.len() < 11 {
        return Err(keys_err("animation frame row too short"));
    }

    let from_color = [frames[0], frames[1], frames[2], 1.0];
    let to_color = [frames[3], frames[4], frames[5], 1.0];
    let from_rotation = [0.0];
    let to_rotation = [solve(frames[6], 60.0, 360.0, true)];

    let curves: Vec<f64> = frames[7..]
        .iter()
        .enumerate()
        .map(|(i, &x)| solve(x, if i % 2 == 1 { -1.0 } else { 0.0 }, 1.0, false))
        .collect();
    let val = Cubic { curves }.get_value(target_time);

    let color: Vec<f64> = interpolate(&from_color, &to_color, val)
        .into_iter()
        .map(|v| v.max(0.0))
        .collect();
    let rotation = interpolate(&from_rotation, &to_rotation, val);
    let matrix = rotation_matrix(rotation[0]);

    let mut str_arr: Vec<String> = color[..color.len() - 1]
        .iter()
        .map(|v| format!("{:x}", v.round() as i64))
        .collect();

    for value in matrix {
        let rounded = ((value * 100.0).round() / 100.0).abs();
        let hex_value = float_to_hex(rounded);
        str_arr.push(if hex_value.starts_with('.') {
            format!("0{hex_value}").to_lowercase()
        } else if hex_value.is_empty() {
            "0".to_string()
        } else {
            hex_value
        });
    }

    str_arr.push("0".to_string());
    str_arr.push("0".to_string());

    let joined = str_arr.join("");
    Ok(joined.replace(['.', '-'], ""))
}

/// Holder of the two scraped keys; [`Self::calc`] derives a fresh token per
/// request.
pub struct XClIdGen {
    vk_bytes: Vec<u8>,
    anim_key: String,
}

impl XClIdGen {
    /// Scrapes the keys off the live web client. Performs a handful of page
    /// fetches, so construct once and share.
    pub async fn create(client: Option<reqwest::Client>) -> Result<Self> {
        let client = match client {
            Some(c) => c,
            None => make_client()?,
        };

        let text = page_text(&client, KEY_PAGE_URL).await?;
        let vk_bytes = parse_vk_bytes(&text)?;
        let anim_idx = parse_anim_idx(&client, &text).await?;
        let anim_arr = parse_anim_arr(&text, &vk_bytes)?;

        let mut frame_time = 1i64;
        for &i in &anim_idx[1..] {
            let byte = *vk_bytes.get(i).ok_or_else(|| keys_err("index out of key range"))?;
            frame_time *= (byte % 16) as i64;
        }

        let first = *anim_idx.first().ok_or_else(|| keys_err("no key indices"))?;
        let byte = *vk_bytes.get(first).ok_or_else(|| keys_err("index out of key range"))?;
        let frame_idx = (byte % 16) as usize;
        let frame_row = anim_arr
            .get(frame_idx)
            .ok_or_else(|| keys_err("frame index out of range"))?;
        let frame_dur = frame_time as f64 / 4096.0;

        let anim_key = calc_anim_key(frame_row, frame_dur)?;
        Ok(Self { vk_bytes, anim_key })
    }

    pub fn new(vk_bytes: Vec<u8>, anim_key: String) -> Self {
        Self { vk_bytes, anim_key }
    }

    /// Derives the header value for one request.
    pub fn calc(&self, method: &str, path: &str) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ts = (now_ms - TS_EPOCH_MS) / 1000;
        let ts_bytes: Vec<u8> = (0..4).map(|i| ((ts >> (i * 8)) & 0xFF) as u8).collect();

        let pld = format!(
            "{}!{path}!{ts}{DEFAULT_KEYWORD}{}",
            method.to_uppercase(),
            self.anim_key
        );
        let hash = Sha256::digest(pld.as_bytes());

        let mut bytes: Vec<u8> = Vec::new();
        bytes.extend_from_slice(&self.vk_bytes);
        bytes.extend_from_slice(&ts_bytes);
        bytes.extend_from_slice(&hash[..16]);
        bytes.push(DEFAULT_RANDOM_NUM);

        let num: u8 = rand::thread_rng().gen();
        let mut out = vec![num];
        out.extend(bytes.iter().map(|x| x ^ num));

        base64::engine::general_purpose::STANDARD_NO_PAD.encode(out)
    }
}
