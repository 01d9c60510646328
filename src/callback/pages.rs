use crate::confirm::PendingChange;
use chrono::{DateTime, Utc};

const STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #f0f2f5;
        }
        .container {
            background: white;
            padding: 2.5rem;
            border-radius: 12px;
            box-shadow: 0 20px 60px rgba(0, 0, 0, 0.15);
            max-width: 560px;
        }
        h1 { color: #1c1e21; margin-bottom: 1rem; }
        p { color: #4a5568; line-height: 1.6; }
        .success { color: #42b72a; font-size: 3rem; text-align: center; }
        .error { color: #f02849; font-size: 3rem; text-align: center; }
        table { width: 100%; border-collapse: collapse; margin: 1rem 0; }
        th, td { text-align: left; padding: 0.5rem; border-bottom: 1px solid #e4e6eb; }
        td code { word-break: break-all; }
        button {
            background: #1877f2;
            color: white;
            border: none;
            border-radius: 6px;
            padding: 0.75rem 1.5rem;
            font-size: 1rem;
            cursor: pointer;
        }
"#;

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
{body}
    </div>
</body>
</html>"#,
        title = escape(title),
    )
}

/// Minimal HTML escaping for text and attribute values
pub(crate) fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn auth_success() -> String {
    layout(
        "Authorization Successful",
        r#"        <div class="success">&#10003;</div>
        <h1>Authorization Successful!</h1>
        <p>Your Meta Ads account has been connected.</p>
        <p>You can now close this window and return to your assistant.</p>"#,
    )
}

pub(crate) fn auth_failure(message: &str) -> String {
    layout(
        "Authorization Failed",
        &format!(
            r#"        <div class="error">&#10007;</div>
        <h1>Authorization Failed</h1>
        <p>{}</p>
        <p>Ask your assistant for a new login link and try again.</p>"#,
            escape(message)
        ),
    )
}

/// Served when the token arrives in the URL fragment, which browsers never
/// send to the server. The script re-issues the request with the fragment
/// moved into the query string.
pub(crate) fn implicit_relay() -> String {
    layout(
        "Completing Authorization",
        r#"        <h1>Completing authorization&hellip;</h1>
        <p id="msg">One moment.</p>
        <script>
            (function () {
                var fragment = window.location.hash.substring(1);
                if (fragment) {
                    window.location.replace("/callback?" + fragment);
                } else {
                    document.getElementById("msg").textContent =
                        "No authorization response was received.";
                }
            })();
        </script>"#,
    )
}

pub(crate) fn confirm_form(change: &PendingChange, capability: &str, expires_at: DateTime<Utc>) -> String {
    let rows: String = change
        .changes
        .iter()
        .map(|(field, value)| {
            format!(
                "            <tr><th>{}</th><td><code>{}</code></td></tr>\n",
                escape(field),
                escape(&value.to_string())
            )
        })
        .collect();

    let changes_json = serde_json::Value::Object(change.changes.clone()).to_string();

    layout(
        "Confirm Update",
        &format!(
            r#"        <h1>Confirm update</h1>
        <p>Your assistant wants to change object <code>{target}</code>:</p>
        <table>
{rows}        </table>
        <p>This request expires at {expires}.</p>
        <form method="post" action="/confirm-update">
            <input type="hidden" name="id" value="{id}">
            <input type="hidden" name="token" value="{token}">
            <input type="hidden" name="changes" value="{changes}">
            <button type="submit">Approve changes</button>
        </form>"#,
            target = escape(&change.target_id),
            rows = rows,
            expires = expires_at.format("%Y-%m-%d %H:%M UTC"),
            id = escape(&change.id),
            token = escape(capability),
            changes = escape(&changes_json),
        ),
    )
}

pub(crate) fn confirm_approved(change: &PendingChange) -> String {
    layout(
        "Update Approved",
        &format!(
            r#"        <div class="success">&#10003;</div>
        <h1>Update approved</h1>
        <p>The changes to <code>{}</code> are approved. Return to your assistant to apply them.</p>"#,
            escape(&change.target_id)
        ),
    )
}

pub(crate) fn confirm_already_approved() -> String {
    layout(
        "Already Approved",
        r#"        <div class="success">&#10003;</div>
        <h1>Already approved</h1>
        <p>This update was approved earlier. Nothing else to do here.</p>"#,
    )
}

pub(crate) fn confirm_stale() -> String {
    layout(
        "Confirmation No Longer Valid",
        r#"        <div class="error">&#10007;</div>
        <h1>This confirmation is no longer valid</h1>
        <p>A newer change was proposed, or this one was already applied or has expired.
        Nothing was changed.</p>"#,
    )
}

pub(crate) fn confirm_rejected(message: &str) -> String {
    layout(
        "Confirmation Rejected",
        &format!(
            r#"        <div class="error">&#10007;</div>
        <h1>Confirmation rejected</h1>
        <p>{}</p>"#,
            escape(message)
        ),
    )
}
