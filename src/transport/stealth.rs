//! Anti-fingerprinting patches applied to stealth browser pages.

/// Named page patches, evaluated in order. Each one is best-effort.
pub const STEALTH_PATCHES: &[(&str, &str)] = &[
    (
        "webdriver",
        r#"Object.defineProperty(navigator, 'webdriver', { get: () => undefined, configurable: true });"#,
    ),
    (
        "chrome_runtime",
        r#"if (!window.chrome) { window.chrome = { runtime: {}, app: {}, csi() {}, loadTimes() {} }; }"#,
    ),
    (
        "permissions",
        r#"
        (() => {
            const query = navigator.permissions && navigator.permissions.query;
            if (!query) return;
            navigator.permissions.query = (p) =>
                p && p.name === 'notifications'
                    ? Promise.resolve({ state: Notification.permission })
                    : query.call(navigator.permissions, p);
        })();
        "#,
    ),
    (
        "plugins",
        r#"
        Object.defineProperty(navigator, 'plugins', {
            get: () => [
                { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
                { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            ],
            configurable: true,
        });
        "#,
    ),
    (
        "languages",
        r#"Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'], configurable: true });"#,
    ),
    (
        "webgl_vendor",
        r#"
        (() => {
            if (typeof WebGLRenderingContext === 'undefined') return;
            const original = WebGLRenderingContext.prototype.getParameter;
            WebGLRenderingContext.prototype.getParameter = function (param) {
                if (param === 37445) return 'Intel Inc.';
                if (param === 37446) return 'Intel Iris OpenGL Engine';
                return original.call(this, param);
            };
        })();
        "#,
    ),
];

/// Resolves once the document has at least reached `interactive`.
pub const READY_STATE_SCRIPT: &str = r#"
new Promise((resolve) => {
    if (document.readyState !== 'loading') {
        resolve(document.readyState);
        return;
    }
    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
    setTimeout(() => resolve('timeout'), 10000);
})
"#;
