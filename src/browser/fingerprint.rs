use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::browser::page::PageHandle;
use crate::config::BrowserProfile;

/// Navigator attributes exposed to page scripts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NavigatorSignature {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub languages: Vec<String>,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub max_touch_points: u32,
    pub webdriver: bool,
}

/// Screen attributes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenSignature {
    pub width: u32,
    pub height: u32,
    pub avail_width: u32,
    pub avail_height: u32,
    pub color_depth: u32,
    pub device_pixel_ratio: f32,
}

/// Generated browser identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fingerprint {
    pub id: String,
    pub user_agent: String,
    pub navigator: NavigatorSignature,
    pub screen: ScreenSignature,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub timezone: String,
    /// HTTP headers consistent with the signature
    pub headers: HashMap<String, String>,
}

/// Browser fingerprint generator with a bounded cache
pub struct FingerprintManager {
    profiles: Vec<BrowserProfile>,
    capacity: usize,
    cache: HashMap<String, Fingerprint>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

impl FingerprintManager {
    pub fn new(profiles: Vec<BrowserProfile>, capacity: usize) -> Self {
        Self {
            profiles,
            capacity: capacity.max(1),
            cache: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Generate and cache a fingerprint built around `user_agent`
    pub fn generate(&mut self, user_agent: &str) -> Fingerprint {
        let fingerprint = self.build(user_agent);

        if self.cache.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.cache.remove(&oldest);
                debug!("Evicted fingerprint {} from cache", oldest);
            }
        }

        self.order.push_back(fingerprint.id.clone());
        self.cache.insert(fingerprint.id.clone(), fingerprint.clone());

        fingerprint
    }

    pub fn get(&self, id: &str) -> Option<&Fingerprint> {
        self.cache.get(id)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn build(&self, user_agent: &str) -> Fingerprint {
        let mut rng = thread_rng();
        let mobile = user_agent.contains("Mobile");

        let profile = if self.profiles.is_empty() {
            None
        } else {
            Some(&self.profiles[rng.gen_range(0..self.profiles.len())])
        };

        let platform = profile
            .map(|p| p.platform.clone())
            .unwrap_or_else(|| platform_from_agent(user_agent).to_string());
        let accept_language = profile
            .map(|p| p.accept_language.clone())
            .unwrap_or_else(|| "en-US,en;q=0.9".to_string());

        let screen = if mobile {
            let (width, height) = (rng.gen_range(360..430), rng.gen_range(740..932));
            ScreenSignature {
                width,
                height,
                avail_width: width,
                avail_height: height,
                color_depth: 24,
                device_pixel_ratio: rng.gen_range(2.0..3.0),
            }
        } else {
            let sizes = [(1366, 768), (1440, 900), (1536, 864), (1920, 1080), (2560, 1440)];
            let (width, height) = sizes[rng.gen_range(0..sizes.len())];
            ScreenSignature {
                width,
                height,
                avail_width: width,
                avail_height: height - 40,
                color_depth: 24,
                device_pixel_ratio: if rng.gen_bool(0.3) { 2.0 } else { 1.0 },
            }
        };

        let (webgl_vendor, webgl_renderer) = if platform.contains("Win") {
            (
                "Google Inc.".to_string(),
                "ANGLE (Intel(R) HD Graphics Direct3D11 vs_5_0 ps_5_0)".to_string(),
            )
        } else if platform.contains("Mac") {
            ("Apple Inc.".to_string(), "Apple GPU".to_string())
        } else {
            (
                "Mesa".to_string(),
                "Mesa DRI Intel(R) HD Graphics 620 (Kaby Lake GT2)".to_string(),
            )
        };

        let languages: Vec<String> = accept_language
            .split(',')
            .map(|part| part.split(';').next().unwrap_or("").trim().to_string())
            .filter(|lang| !lang.is_empty())
            .collect();

        let navigator = NavigatorSignature {
            user_agent: user_agent.to_string(),
            platform: platform.clone(),
            language: languages.first().cloned().unwrap_or_else(|| "en-US".to_string()),
            languages,
            hardware_concurrency: [2, 4, 8, 12, 16][rng.gen_range(0..5)],
            device_memory: [4, 8, 16][rng.gen_range(0..3)],
            max_touch_points: if mobile { 5 } else { 0 },
            webdriver: false,
        };

        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), user_agent.to_string());
        headers.insert("Accept-Language".to_string(), accept_language);
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
        );
        headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        if let Some(profile) = profile {
            for (key, value) in &profile.extra_headers {
                headers.insert(key.clone(), value.clone());
            }
        }

        Fingerprint {
            id: Uuid::new_v4().to_string(),
            user_agent: user_agent.to_string(),
            navigator,
            screen,
            webgl_vendor,
            webgl_renderer,
            timezone: "America/New_York".to_string(),
            headers,
        }
    }

    /// Inject `fingerprint` into a live page.
    ///
    /// Falls back to a plain user-agent override when the injection script
    /// is rejected. Never fails; returns whether full injection succeeded.
    pub async fn apply_to_page(page: &dyn PageHandle, fingerprint: &Fingerprint) -> bool {
        let script = injection_script(fingerprint);

        match page.evaluate(&script).await {
            Ok(()) => {
                debug!("Injected fingerprint {}", fingerprint.id);
                true
            }
            Err(e) => {
                warn!("Fingerprint injection failed, falling back to user agent override: {}", e);
                if let Err(e) = page.set_user_agent(&fingerprint.user_agent).await {
                    warn!("User agent override failed: {}", e);
                }
                false
            }
        }
    }
}

fn platform_from_agent(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows") {
        "Win32"
    } else if user_agent.contains("Mac OS") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

/// Script overriding navigator and screen properties
fn injection_script(fingerprint: &Fingerprint) -> String {
    let navigator = serde_json::to_string(&fingerprint.navigator).unwrap_or_else(|_| "{}".to_string());
    let screen = serde_json::to_string(&fingerprint.screen).unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"(() => {{
  const nav = {navigator};
  const scr = {screen};
  const define = (obj, key, value) => Object.defineProperty(obj, key, {{ get: () => value, configurable: true }});
  define(navigator, 'userAgent', nav.user_agent);
  define(navigator, 'platform', nav.platform);
  define(navigator, 'language', nav.language);
  define(navigator, 'languages', nav.languages);
  define(navigator, 'hardwareConcurrency', nav.hardware_concurrency);
  define(navigator, 'deviceMemory', nav.device_memory);
  define(navigator, 'maxTouchPoints', nav.max_touch_points);
  define(navigator, 'webdriver', nav.webdriver);
  define(screen, 'width', scr.width);
  define(screen, 'height', scr.height);
  define(screen, 'availWidth', scr.avail_width);
  define(screen, 'availHeight', scr.avail_height);
  define(screen, 'colorDepth', scr.color_depth);
  define(window, 'devicePixelRatio', scr.device_pixel_ratio);
}})();"#
    )
}
