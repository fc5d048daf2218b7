//! Static command descriptors: the source of truth for the exported command
//! schema. The parser (clap derive) and this table describe the same surface;
//! `hephaestus schema` renders the table as JSON for tooling.

use serde_json::{json, Value};

pub struct FlagDescriptor {
    pub name: &'static str,
    pub value: &'static str,
    pub help: &'static str,
    pub repeatable: bool,
}

pub struct CommandDescriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub flags: &'static [FlagDescriptor],
    pub example: &'static str,
}

pub const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "guard-rails",
        help: "Run the quality-gate pipeline over the workspace",
        flags: &[
            FlagDescriptor { name: "--workspace", value: "path", help: "Workspace root (default .)", repeatable: false },
            FlagDescriptor { name: "--no-format", value: "flag", help: "Skip the formatting gate", repeatable: false },
            FlagDescriptor { name: "--drift", value: "flag", help: "Fail on declared-vs-installed tool drift", repeatable: false },
            FlagDescriptor { name: "--use-plugins", value: "flag", help: "Run discovered plugins instead of the legacy sequence", repeatable: false },
        ],
        example: "hephaestus guard-rails --drift",
    },
    CommandDescriptor {
        name: "cleanup",
        help: "Sweep workspace build caches and cruft with safety rails",
        flags: &[
            FlagDescriptor { name: "--root", value: "path", help: "Sweep root (default .)", repeatable: false },
            FlagDescriptor { name: "--extra-path", value: "path", help: "Additional target outside the standard patterns", repeatable: true },
            FlagDescriptor { name: "--deep-clean", value: "flag", help: "Also sweep node_modules and the virtualenv", repeatable: false },
            FlagDescriptor { name: "--dry-run", value: "flag", help: "Preview only; delete nothing", repeatable: false },
            FlagDescriptor { name: "--yes", value: "flag", help: "Pre-approve targets outside the root", repeatable: false },
            FlagDescriptor { name: "--audit-manifest", value: "path", help: "Write the cleanup report as JSON", repeatable: false },
        ],
        example: "hephaestus cleanup --deep-clean --dry-run",
    },
    CommandDescriptor {
        name: "release install",
        help: "Download, verify, and install a release wheelhouse",
        flags: &[
            FlagDescriptor { name: "--repository", value: "owner/name", help: "Release repository", repeatable: false },
            FlagDescriptor { name: "--tag", value: "tag", help: "Release tag (default latest)", repeatable: false },
            FlagDescriptor { name: "--asset-pattern", value: "glob", help: "Wheelhouse asset pattern", repeatable: false },
            FlagDescriptor { name: "--manifest-pattern", value: "glob", help: "Checksum manifest pattern", repeatable: false },
            FlagDescriptor { name: "--sigstore-pattern", value: "glob", help: "Sigstore bundle pattern", repeatable: false },
            FlagDescriptor { name: "--require-sigstore", value: "flag", help: "Fail when no bundle is published", repeatable: false },
            FlagDescriptor { name: "--sigstore-identity", value: "glob", help: "Identity pin pattern", repeatable: true },
            FlagDescriptor { name: "--allow-unsigned", value: "flag", help: "Proceed without a checksum manifest", repeatable: false },
            FlagDescriptor { name: "--timeout", value: "seconds", help: "Per-attempt network timeout", repeatable: false },
            FlagDescriptor { name: "--max-retries", value: "count", help: "Download attempts, including the first", repeatable: false },
            FlagDescriptor { name: "--destination", value: "path", help: "Install destination directory", repeatable: false },
        ],
        example: "hephaestus release install --repository org/tool --require-sigstore --sigstore-identity 'https://github.com/org/*'",
    },
];

/// Render the descriptor table as the exported command schema.
pub fn schema_json() -> Value {
    json!({
        "name": "hephaestus",
        "version": env!("CARGO_PKG_VERSION"),
        "commands": COMMANDS.iter().map(|command| json!({
            "name": command.name,
            "help": command.help,
            "example": command.example,
            "flags": command.flags.iter().map(|flag| json!({
                "name": flag.name,
                "value": flag.value,
                "help": flag.help,
                "repeatable": flag.repeatable,
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}
