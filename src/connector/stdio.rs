//! stdio connector kind: spawn `command` with `args`/`env`, pipe stdio,
//! perform the MCP initialize handshake (§4.2).

use rmcp::{
    service::RunningService,
    transport::{ConfigureCommandExt, TokioChildProcess},
    RoleClient, ServiceExt,
};

use crate::{
    error::{HubError, HubResult},
    settings::ServerConfig,
};

pub async fn connect(
    config: &ServerConfig,
    handler: super::ConnectorClientHandler,
) -> HubResult<RunningService<RoleClient, super::ConnectorClientHandler>> {
    let command = config
        .command
        .as_ref()
        .ok_or_else(|| HubError::Config("stdio server requires `command`".to_string()))?;

    let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
        |cmd| {
            cmd.args(&config.args)
                .envs(config.env.iter())
                .stderr(std::process::Stdio::inherit());
        },
    ))
    .map_err(|e| HubError::Transport {
        server: command.clone(),
        message: format!("spawn stdio transport: {e}"),
    })?;

    handler
        .serve(transport)
        .await
        .map_err(|e| HubError::Transport {
            server: command.clone(),
            message: format!("initialize stdio client: {e}"),
        })
}
