//! Challenge tokens and the telemetry interstitial.
//!
//! The interstitial is a neutral page that records pointer movement and a
//! browser fingerprint, then posts them back with an HMAC-signed token that
//! carries the quick score.

use crate::config::ChallengeConfig;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Fields of a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub issued_at: u64,
    pub nonce: String,
    pub quick_score: u8,
}

/// Generates and verifies challenge tokens.
pub struct ChallengeManager {
    secret: Vec<u8>,
    validity_seconds: u64,
    /// Cookie name for storing tokens
    pub cookie_name: String,
    /// Path the interstitial posts to
    pub submit_path: String,
}

impl ChallengeManager {
    pub fn new(config: &ChallengeConfig) -> Self {
        Self {
            secret: config.token_secret.clone().into_bytes(),
            validity_seconds: config.token_validity_seconds,
            cookie_name: config.cookie_name.clone(),
            submit_path: config.submit_path.clone(),
        }
    }

    /// Generate a challenge token.
    ///
    /// Token format: `{issued_at}|{nonce}|{quick_score}|{hmac}`
    pub fn generate_token(&self, quick_score: u8) -> String {
        self.token_at(now_secs(), quick_score)
    }

    fn token_at(&self, issued_at: u64, quick_score: u8) -> String {
        let nonce = generate_nonce();
        let data = format!("{}|{}|{}", issued_at, nonce, quick_score.min(100));
        let signature = self.sign(&data);

        format!("{}|{}", data, signature)
    }

    /// Verify a challenge token.
    ///
    /// Returns `None` if the token is malformed, tampered with or expired.
    pub fn verify_token(&self, token: &str) -> Option<ChallengeToken> {
        let parts: Vec<&str> = token.split('|').collect();
        if parts.len() != 4 {
            return None;
        }

        let issued_at: u64 = parts[0].parse().ok()?;
        let nonce = parts[1];
        let quick_score: u8 = parts[2].parse().ok().filter(|s| *s <= 100)?;
        let provided_signature = parts[3];

        let now = now_secs();
        // Zero validity means immediately expired
        if self.validity_seconds == 0 || now.saturating_sub(issued_at) > self.validity_seconds {
            return None;
        }
        // Tokens from the future were not issued by this clock
        if issued_at > now.saturating_add(5) {
            return None;
        }

        let data = format!("{}|{}|{}", issued_at, nonce, quick_score);
        let expected_signature = self.sign(&data);

        if !constant_time_eq(provided_signature.as_bytes(), expected_signature.as_bytes()) {
            return None;
        }

        Some(ChallengeToken {
            issued_at,
            nonce: nonce.to_string(),
            quick_score,
        })
    }

    /// Extract token from cookie header.
    pub fn extract_token_from_cookies(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
            .map(str::to_string)
    }

    /// `Set-Cookie` value carrying a token.
    pub fn cookie(&self, token: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name, token, self.validity_seconds
        )
    }

    /// Render the neutral interstitial page for one token.
    pub fn render_interstitial(&self, token: &str, capture_window_ms: u64) -> String {
        let token_js = js_string(token);
        let submit_js = js_string(&self.submit_path);
        INTERSTITIAL_TEMPLATE
            .replace("{{TOKEN}}", &token_js)
            .replace("{{SUBMIT_PATH}}", &submit_js)
            .replace("{{WINDOW_MS}}", &capture_window_ms.to_string())
    }

    /// Sign data with HMAC-SHA256.
    fn sign(&self, data: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl Default for ChallengeManager {
    fn default() -> Self {
        Self::new(&ChallengeConfig::default())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of signatures.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// JSON string literal that is also safe inside a `<script>` block.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

const INTERSTITIAL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<meta name="robots" content="noindex, nofollow">
<title>Loading</title>
<style>
body{font-family:system-ui,sans-serif;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;background:#fafafa;color:#444}
.spinner{width:32px;height:32px;border:3px solid #ddd;border-top-color:#888;border-radius:50%;animation:spin 1s linear infinite;margin:0 auto 12px}
@keyframes spin{to{transform:rotate(360deg)}}
</style>
</head>
<body>
<div><div class="spinner"></div><p>Loading, please wait&hellip;</p></div>
<script>
(function () {
  var token = {{TOKEN}};
  var submitPath = {{SUBMIT_PATH}};
  var windowMs = {{WINDOW_MS}};
  var start = performance.now();
  var path = [], scrolls = 0, clicks = 0, sent = false;

  document.addEventListener('mousemove', function (e) {
    if (path.length < 2000) path.push({x: e.clientX, y: e.clientY, t: Math.round(performance.now() - start)});
  }, {passive: true});
  document.addEventListener('touchmove', function (e) {
    var t = e.touches[0];
    if (t && path.length < 2000) path.push({x: t.clientX, y: t.clientY, t: Math.round(performance.now() - start)});
  }, {passive: true});
  window.addEventListener('scroll', function () { scrolls++; }, {passive: true});
  document.addEventListener('click', function () { clicks++; });

  function hash(s) {
    var h1 = 0x811c9dc5, h2 = 0x01000193;
    for (var i = 0; i < s.length; i++) {
      h1 = Math.imul(h1 ^ s.charCodeAt(i), 16777619);
      h2 = Math.imul(h2 ^ s.charCodeAt(i), 2246822507);
    }
    return ((h1 >>> 0).toString(16) + (h2 >>> 0).toString(16)).padStart(16, '0');
  }

  var audioHash = null;
  try {
    var AudioCtx = window.OfflineAudioContext || window.webkitOfflineAudioContext;
    if (AudioCtx) {
      var ac = new AudioCtx(1, 5000, 44100);
      var osc = ac.createOscillator();
      var comp = ac.createDynamicsCompressor();
      osc.type = 'triangle'; osc.frequency.value = 10000;
      comp.threshold.value = -50; comp.knee.value = 40; comp.ratio.value = 12;
      comp.attack.value = 0; comp.release.value = 0.25;
      osc.connect(comp); comp.connect(ac.destination); osc.start(0);
      var rendered = function (buf) {
        var data = buf.getChannelData(0), sum = 0;
        for (var i = 4500; i < 5000; i++) sum += Math.abs(data[i]);
        audioHash = sum.toString();
      };
      var job = ac.startRendering();
      if (job && job.then) job.then(rendered).catch(function () {});
      else ac.oncomplete = function (e) { rendered(e.renderedBuffer); };
    }
  } catch (e) {}

  function fingerprint() {
    var fp = {
      screen: {width: screen.width, height: screen.height, colorDepth: screen.colorDepth, pixelRatio: window.devicePixelRatio || 1},
      timezone: (Intl.DateTimeFormat().resolvedOptions().timeZone) || null,
      timezoneOffset: new Date().getTimezoneOffset(),
      language: navigator.language || null,
      languages: navigator.languages ? Array.prototype.slice.call(navigator.languages) : [],
      platform: navigator.platform || null,
      userAgent: navigator.userAgent,
      plugins: navigator.plugins ? Array.prototype.map.call(navigator.plugins, function (p) { return p.name; }) : [],
      webdriver: !!navigator.webdriver,
      hardwareConcurrency: navigator.hardwareConcurrency || null
    };
    try {
      var c = document.createElement('canvas');
      var ctx = c.getContext('2d');
      ctx.textBaseline = 'top'; ctx.font = '14px Arial'; ctx.fillStyle = '#f60';
      ctx.fillRect(10, 1, 62, 20); ctx.fillStyle = '#069'; ctx.fillText('Cwm fjordbank glyphs vext quiz', 2, 15);
      fp.canvasHash = hash(c.toDataURL());
    } catch (e) {}
    try {
      var gl = document.createElement('canvas').getContext('webgl');
      var dbg = gl && gl.getExtension('WEBGL_debug_renderer_info');
      if (dbg) {
        fp.webglRenderer = gl.getParameter(dbg.UNMASKED_RENDERER_WEBGL);
        fp.webglVendor = gl.getParameter(dbg.UNMASKED_VENDOR_WEBGL);
      }
    } catch (e) {}
    if (audioHash) fp.audioHash = audioHash;
    return fp;
  }

  function submit(complete) {
    if (sent) return;
    sent = true;
    var body = JSON.stringify({
      token: token,
      mousePath: path,
      dwellTimeMs: Math.round(performance.now() - start),
      scrollEvents: scrolls,
      clickEvents: clicks,
      complete: complete,
      fingerprint: fingerprint()
    });
    fetch(submitPath, {method: 'POST', headers: {'Content-Type': 'application/json'}, credentials: 'same-origin', body: body})
      .then(function (r) { return r.json(); })
      .then(function (d) { if (d && d.redirect) window.location.replace(d.redirect); })
      .catch(function () {});
  }

  setTimeout(function () { submit(true); }, windowMs);
  window.addEventListener('pagehide', function () { submit(false); });
})();
</script>
</body>
</html>
"#;
