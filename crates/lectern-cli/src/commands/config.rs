use std::env;

use lectern_core::util::{is_http_url, normalize_text_option};

use crate::cli::ConfigCommands;
use crate::commands::common::USER_ID_ENV;
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            profile,
            supabase_url,
            supabase_anon_key,
            user_id,
            no_activate,
        } => run_config_init(
            profile.as_deref().or(global_profile),
            CliProfile {
                supabase_url,
                supabase_anon_key,
                user_id,
            },
            no_activate,
        ),
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    explicit: CliProfile,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load()?;
    let (profile_name, existing) = config.select(profile_name);

    let merged = merge_profile(&existing, &explicit, &profile_from_env());
    validate_profile(&merged)?;
    config.set_profile(&profile_name, merged.clone(), !no_activate);

    let path = config.save()?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let missing = merged.missing_fields();
    if missing.is_empty() {
        println!("Profile '{profile_name}' is ready. Set LECTERN_ACCESS_TOKEN and run `lectern sync`.");
    } else {
        println!("Profile '{}' is missing: {}", profile_name, missing.join(", "));
    }
    Ok(())
}

fn profile_from_env() -> CliProfile {
    CliProfile {
        supabase_url: normalize_text_option(env::var("SUPABASE_URL").ok()),
        supabase_anon_key: normalize_text_option(env::var("SUPABASE_ANON_KEY").ok()),
        user_id: normalize_text_option(env::var(USER_ID_ENV).ok()),
    }
}

/// Explicit flags, then environment, then what the profile already had.
pub fn merge_profile(existing: &CliProfile, explicit: &CliProfile, from_env: &CliProfile) -> CliProfile {
    CliProfile {
        supabase_url: explicit
            .supabase_url()
            .or_else(|| from_env.supabase_url())
            .or_else(|| existing.supabase_url()),
        supabase_anon_key: explicit
            .supabase_anon_key()
            .or_else(|| from_env.supabase_anon_key())
            .or_else(|| existing.supabase_anon_key()),
        user_id: explicit
            .user_id()
            .or_else(|| from_env.user_id())
            .or_else(|| existing.user_id()),
    }
}

pub fn validate_profile(profile: &CliProfile) -> Result<(), CliError> {
    if let Some(url) = profile.supabase_url() {
        if !is_http_url(&url) {
            return Err(CliError::Config(
                "supabase_url must include http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}
