//! Status computation from the plan's `status` template.
//!
//! The status template looks at the same render input as the action
//! templates — including the live source objects — and reports, per
//! lifecycle operation, the observed state of the deployment. The
//! controllers copy the relevant slice into object status verbatim.

use tracing::debug;

use crate::errors::OperonResult;
use crate::materialize::{select_file, MaterializeRequest, Materializer, STATUS_FILE};
use crate::model::{properties, Action, StatusDoc};
use crate::render::{renderer_for, renderer_input};
use crate::store::ResourceStore;

impl Materializer {
    /// Render and parse the status document for a lifecycle object.
    ///
    /// `action` selects the release identity (bind status renders under the
    /// binding's name); the returned document always carries every section.
    pub async fn compute_status(
        &self,
        store: &dyn ResourceStore,
        request: &MaterializeRequest,
        action: Action,
    ) -> OperonResult<StatusDoc> {
        let input = self.prepare(store, request, action).await?;
        let template = input.plan.template(Action::Status)?;
        let render_input =
            renderer_input(template, &input.release_name, &request.namespace, input.values)?;
        let output = renderer_for(template.engine).render(&render_input)?;
        let content = select_file(&output, STATUS_FILE)?;
        let status = properties::parse_status(content)?;
        debug!(
            instance_id = %request.instance_id,
            action = %action,
            provision_state = ?status.provision.state,
            "computed status"
        );
        Ok(status)
    }
}
