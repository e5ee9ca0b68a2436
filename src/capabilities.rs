//! Dynamic capability registration/unregistration.
//!
//! Servers that advertise a capability lazily (instead of at `initialize`
//! time) ask the client to register it via `client/registerCapability`, and
//! withdraw it via `client/unregisterCapability`. This module folds those
//! requests into a running [`ServerCapabilities`] snapshot.
//!
//! Unsupported or malformed registrations are swallowed and logged rather
//! than propagated — one server quirk should not take down the session.

use lsp_types::{
    CodeActionOptions, CodeActionProviderCapability, CompletionOptions,
    DocumentFormattingOptions, HoverProviderCapability, OneOf, Registration, RenameOptions,
    SemanticTokensOptions, SemanticTokensServerCapabilities, ServerCapabilities, Unregistration,
};
use tracing::{debug, warn};

/// Apply a batch of `client/registerCapability` registrations to `caps`.
pub fn apply_registrations(caps: &mut ServerCapabilities, registrations: &[Registration]) {
    for registration in registrations {
        if let Err(reason) = apply_registration(caps, registration) {
            warn!(
                method = %registration.method,
                id = %registration.id,
                %reason,
                "failed to apply dynamic capability registration"
            );
        }
    }
}

/// Apply a batch of `client/unregisterCapability` withdrawals to `caps`.
pub fn apply_unregistrations(caps: &mut ServerCapabilities, unregistrations: &[Unregistration]) {
    for unregistration in unregistrations {
        if let Err(reason) = apply_unregistration(caps, unregistration) {
            warn!(
                method = %unregistration.method,
                id = %unregistration.id,
                %reason,
                "failed to apply dynamic capability unregistration"
            );
        }
    }
}

fn decode_options<T: serde::de::DeserializeOwned>(
    registration: &Registration,
) -> Result<Option<T>, String> {
    match &registration.register_options {
        None => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| e.to_string()),
    }
}

fn apply_registration(
    caps: &mut ServerCapabilities,
    registration: &Registration,
) -> Result<(), String> {
    match registration.method.as_str() {
        "textDocument/semanticTokens" => {
            let options: Option<SemanticTokensOptions> = decode_options(registration)?;
            let options = options.ok_or_else(|| "missing registerOptions".to_string())?;
            caps.semantic_tokens_provider =
                Some(SemanticTokensServerCapabilities::SemanticTokensOptions(options));
        }
        "textDocument/formatting" => {
            let options: Option<DocumentFormattingOptions> = decode_options(registration)?;
            caps.document_formatting_provider = Some(match options {
                Some(options) => OneOf::Right(options),
                None => OneOf::Left(true),
            });
        }
        "textDocument/codeAction" => {
            let options: Option<CodeActionOptions> = decode_options(registration)?;
            caps.code_action_provider = Some(match options {
                Some(options) => CodeActionProviderCapability::Options(options),
                None => CodeActionProviderCapability::Simple(true),
            });
        }
        "textDocument/completion" => {
            let options: Option<CompletionOptions> = decode_options(registration)?;
            caps.completion_provider = Some(options.unwrap_or_default());
        }
        "textDocument/hover" => {
            caps.hover_provider = Some(HoverProviderCapability::Simple(true));
        }
        "textDocument/rename" => {
            let options: Option<RenameOptions> = decode_options(registration)?;
            caps.rename_provider = Some(match options {
                Some(options) => OneOf::Right(options),
                None => OneOf::Left(true),
            });
        }
        "workspace/didChangeWatchedFiles" => {
            debug!("registered file-watcher capability; no capability field to update");
        }
        other => {
            return Err(format!("unrecognized registration method {other}"));
        }
    }
    Ok(())
}

fn apply_unregistration(
    caps: &mut ServerCapabilities,
    unregistration: &Unregistration,
) -> Result<(), String> {
    match unregistration.method.as_str() {
        "textDocument/semanticTokens" => {
            caps.semantic_tokens_provider = None;
        }
        "textDocument/formatting" => {
            caps.document_formatting_provider = None;
        }
        "textDocument/codeAction" => {
            caps.code_action_provider = None;
        }
        "textDocument/completion" => {
            caps.completion_provider = None;
        }
        "textDocument/hover" => {
            caps.hover_provider = None;
        }
        "textDocument/rename" => {
            caps.rename_provider = None;
        }
        "workspace/didChangeWatchedFiles" => {
            debug!("unregistered file-watcher capability; no capability field to clear");
        }
        other => {
            return Err(format!("unrecognized unregistration method {other}"));
        }
    }
    Ok(())
}
