use crate::http::{header_value, Headers};
use std::collections::HashSet;

pub struct WebFingerprint {
    pub name: &'static str,
    pub location: FingerprintLocation,
    pub keyword: &'static str,
}

pub enum FingerprintLocation {
    /// `Server` 头，大小写不敏感
    Server,
    /// `X-Powered-By` 头，大小写不敏感
    PoweredBy,
    /// 指定响应头存在即命中
    HeaderPresent(&'static str),
    /// 指定响应头包含关键字，大小写敏感
    HeaderContains(&'static str),
    /// 正文，大小写不敏感
    Body,
    /// 正文，大小写敏感
    BodyExact,
}

const fn fp(name: &'static str, location: FingerprintLocation, keyword: &'static str) -> WebFingerprint {
    WebFingerprint { name, location, keyword }
}

use FingerprintLocation::{Body, BodyExact, HeaderContains, HeaderPresent, PoweredBy, Server};

/// 探测阶段使用的轻量规则。
pub const PROBE_RULES: &[WebFingerprint] = &[
    fp("Nginx", Server, "nginx"),
    fp("Apache", Server, "apache"),
    fp("Cloudflare", Server, "cloudflare"),
    fp("IIS", Server, "iis"),
    fp("PHP", PoweredBy, "php"),
    fp("ASP.NET", PoweredBy, "asp.net"),
    fp("Express.js", PoweredBy, "express"),
    fp("React", Body, "react"),
    fp("React", BodyExact, "__NEXT_DATA__"),
    fp("Angular", BodyExact, "ng-"),
    fp("Angular", Body, "angular"),
    fp("Vue.js", Body, "vue"),
    fp("jQuery", Body, "jquery"),
    fp("WordPress", Body, "wordpress"),
    fp("WordPress", BodyExact, "wp-content"),
    fp("Drupal", Body, "drupal"),
    fp("Joomla", Body, "joomla"),
    fp("Laravel", Body, "laravel"),
    fp("Django", Body, "django"),
    fp("Ruby on Rails", Body, "rails"),
    fp("Ruby on Rails", BodyExact, "csrf-token"),
    fp("Cloudflare", HeaderPresent("CF-Ray"), ""),
    fp("CloudFront", HeaderContains("Via"), "cloudfront"),
];

/// 深度分析使用的扩展规则。
pub const ANALYZER_RULES: &[WebFingerprint] = &[
    fp("Nginx", Server, "nginx"),
    fp("Apache", Server, "apache"),
    fp("IIS", Server, "iis"),
    fp("Gunicorn", Server, "gunicorn"),
    fp("OpenResty", Server, "openresty"),
    fp("PHP", PoweredBy, "php"),
    fp("ASP.NET", PoweredBy, "asp.net"),
    fp("Express.js", PoweredBy, "express"),
    fp("Next.js", PoweredBy, "next"),
    fp("ThinkPHP", PoweredBy, "thinkphp"),
    fp("Next.js", BodyExact, "__NEXT_DATA__"),
    fp("Next.js", BodyExact, "_next/static"),
    fp("Nuxt.js", BodyExact, "__NUXT__"),
    fp("React", Body, "react"),
    fp("React", BodyExact, "data-reactroot"),
    fp("AngularJS", BodyExact, "ng-app"),
    fp("AngularJS", BodyExact, "ng-controller"),
    fp("Angular", BodyExact, "_angular"),
    fp("Vue.js", BodyExact, "Vue."),
    fp("Vue.js", BodyExact, "v-bind"),
    fp("Svelte", Body, "svelte"),
    fp("WordPress", BodyExact, "wp-content"),
    fp("WordPress", BodyExact, "wp-includes"),
    fp("Drupal", BodyExact, "Drupal."),
    fp("Joomla", Body, "joomla"),
    fp("Shopify", BodyExact, "shopify"),
    fp("Wix", BodyExact, "wix.com"),
    fp("Bootstrap", Body, "bootstrap"),
    fp("Tailwind CSS", Body, "tailwind"),
    fp("Cloudflare", HeaderPresent("Cf-Ray"), ""),
    fp("CloudFront", HeaderContains("Via"), "cloudfront"),
    fp("Amazon S3", HeaderContains("Server"), "AmazonS3"),
    fp("Shiro", HeaderContains("Set-Cookie"), "rememberMe="),
    fp("Jenkins", HeaderPresent("X-Jenkins"), ""),
    fp("SpringBoot", BodyExact, "Whitelabel Error Page"),
    fp("Tomcat", BodyExact, "Apache Tomcat"),
    fp("Weblogic", BodyExact, "/console/login/LoginForm.jsp"),
    fp("JBoss", BodyExact, "JBoss Application Server"),
];

/// 按规则顺序匹配，同名技术只记录一次。
pub fn detect(rules: &[WebFingerprint], headers: &Headers, body: &str) -> Vec<String> {
    let body_lower = body.to_lowercase();
    let mut detected = Vec::new();
    let mut seen = HashSet::new();

    for rule in rules {
        if seen.contains(rule.name) {
            continue;
        }

        let matched = match rule.location {
            Server => header_contains_ci(headers, "Server", rule.keyword),
            PoweredBy => header_contains_ci(headers, "X-Powered-By", rule.keyword),
            HeaderPresent(name) => header_value(headers, name).is_some(),
            HeaderContains(name) => header_value(headers, name).is_some_and(|v| v.contains(rule.keyword)),
            Body => body_lower.contains(rule.keyword),
            BodyExact => body.contains(rule.keyword),
        };

        if matched {
            detected.push(rule.name.to_string());
            seen.insert(rule.name);
        }
    }

    detected
}

fn header_contains_ci(headers: &Headers, name: &str, keyword: &str) -> bool {
    header_value(headers, name).is_some_and(|v| v.to_lowercase().contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_detect_from_headers() {
        let h = headers(&[("Server", "nginx/1.24.0"), ("X-Powered-By", "PHP/8.2"), ("Cf-Ray", "abc")]);
        let techs = detect(PROBE_RULES, &h, "");
        assert_eq!(techs, vec!["Nginx", "PHP", "Cloudflare"]);
    }

    #[test]
    fn test_detect_from_body_deduplicates() {
        let body = r#"<link href="/wp-content/themes/x.css"><script src="jquery.min.js"></script> WordPress"#;
        let techs = detect(PROBE_RULES, &Headers::new(), body);
        assert_eq!(techs, vec!["jQuery", "WordPress"]);
    }

    #[test]
    fn test_analyzer_rules_case_sensitive_markers() {
        let body = r#"<script id="__NEXT_DATA__">{}</script><script src="/_next/static/app.js"></script>"#;
        let techs = detect(ANALYZER_RULES, &Headers::new(), body);
        assert!(techs.contains(&"Next.js".to_string()));
        assert_eq!(techs.iter().filter(|t| *t == "Next.js").count(), 1);

        let techs = detect(ANALYZER_RULES, &Headers::new(), "drupal. lowercase only");
        assert!(!techs.contains(&"Drupal".to_string()));
    }

    #[test]
    fn test_analyzer_shiro_cookie() {
        let h = headers(&[("Set-Cookie", "rememberMe=deleteMe; Path=/")]);
        assert_eq!(detect(ANALYZER_RULES, &h, ""), vec!["Shiro"]);
    }
}
