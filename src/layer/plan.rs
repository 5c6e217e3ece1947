use crate::{
    engine::{Engine, ExecArgs, OpDesc, PrimitiveDesc, Role},
    error::{KernelError, LayerError},
    memory::MemoryDesc,
    signature::Signature,
};
use anyhow::Result;

#[derive(Debug)]
struct Operand {
    role: Role,
    user: MemoryDesc,
    primitive: MemoryDesc,
    /// Present iff the primitive layout differs from the user layout.
    scratch: Option<Vec<f32>>,
}

impl Operand {
    fn new(role: Role, primitive: &MemoryDesc) -> Self {
        let user = primitive.to_plain();
        let scratch = if &user != primitive {
            Some(vec![0f32; primitive.len()])
        } else {
            None
        };
        Self {
            role,
            user,
            primitive: primitive.clone(),
            scratch,
        }
    }
    fn check_len(&self, actual: usize) -> Result<(), LayerError> {
        let expected = self.user.len();
        if actual != expected {
            return Err(LayerError::BufferSize {
                role: self.role,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// A primitive with its resolved reorders.
///
/// Built once per layer and path, the reorder decisions never change afterwards.
#[derive(Debug)]
pub struct Plan {
    pd: PrimitiveDesc,
    inputs: Vec<Operand>,
    outputs: Vec<Operand>,
}

impl Plan {
    /// Builds the primitive descriptor for `op` and resolves reorders of plain caller buffers.
    ///
    /// **Errors**
    /// The engine does not support `op`.
    pub(crate) fn new(
        engine: &dyn Engine,
        op: &OpDesc,
        hint: Option<&PrimitiveDesc>,
        signature: &Signature,
    ) -> Result<Self> {
        let pd = engine.primitive_desc(op, hint)?;
        let operand = |role: Role| -> Result<Operand, KernelError> {
            let md = pd
                .memory_desc(role)
                .ok_or(KernelError::MissingArgument(role))?;
            Ok(Operand::new(role, md))
        };
        let inputs = op
            .inputs()
            .into_iter()
            .map(operand)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = op
            .outputs()
            .into_iter()
            .map(operand)
            .collect::<Result<Vec<_>, _>>()?;
        let plan = Self {
            pd,
            inputs,
            outputs,
        };
        log::debug!(
            "{signature} {:?} plan, reorders: {:?}",
            op.prop(),
            plan.reorders()
        );
        Ok(plan)
    }
    /// The primitive descriptor.
    pub fn primitive_desc(&self) -> &PrimitiveDesc {
        &self.pd
    }
    /// Roles whose buffers are reordered on each execution.
    pub fn reorders(&self) -> Vec<Role> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .filter(|operand| operand.scratch.is_some())
            .map(|operand| operand.role)
            .collect()
    }
    /// Executes the primitive over plain caller buffers.
    ///
    /// Inputs are matched by role, `outputs` must be in the order of [`OpDesc::outputs()`].
    ///
    /// **Errors**
    /// - A buffer is missing or has the wrong length.
    /// - The kernel failed.
    pub(crate) fn execute(
        &mut self,
        engine: &dyn Engine,
        inputs: &[(Role, &[f32])],
        outputs: &mut [(Role, &mut [f32])],
    ) -> Result<()> {
        let find = |role: Role| {
            inputs
                .iter()
                .find_map(|(r, data)| if *r == role { Some(*data) } else { None })
                .ok_or(KernelError::MissingArgument(role))
        };
        for operand in self.inputs.iter_mut() {
            let data = find(operand.role)?;
            operand.check_len(data.len())?;
            if let Some(scratch) = operand.scratch.as_mut() {
                engine.reorder(&operand.user, data, &operand.primitive, scratch)?;
            }
        }
        if let Some(operand) = self.outputs.get(outputs.len()) {
            return Err(KernelError::MissingArgument(operand.role).into());
        }
        for (operand, (role, data)) in self.outputs.iter().zip(outputs.iter()) {
            if operand.role != *role {
                return Err(KernelError::MissingArgument(operand.role).into());
            }
            operand.check_len(data.len())?;
        }
        let mut args = ExecArgs::default();
        for operand in self.inputs.iter() {
            let data = match operand.scratch.as_ref() {
                Some(scratch) => scratch.as_slice(),
                None => find(operand.role)?,
            };
            args.input(operand.role, data);
        }
        for (operand, (_, data)) in self.outputs.iter_mut().zip(outputs.iter_mut()) {
            let data = match operand.scratch.as_mut() {
                Some(scratch) => scratch.as_mut_slice(),
                None => &mut **data,
            };
            args.output(operand.role, data);
        }
        engine.execute(&self.pd, args)?;
        for (operand, (_, data)) in self.outputs.iter().zip(outputs.iter_mut()) {
            if let Some(scratch) = operand.scratch.as_ref() {
                engine.reorder(&operand.primitive, scratch, &operand.user, data)?;
            }
        }
        Ok(())
    }
}

/// Takes the plan out of `slot`, building it with `f` on first use.
pub(crate) fn ensure<'a>(
    slot: &'a mut Option<Plan>,
    f: impl FnOnce() -> Result<Plan>,
) -> Result<&'a mut Plan> {
    let plan = match slot.take() {
        Some(plan) => plan,
        None => f()?,
    };
    Ok(slot.insert(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{HostEngine, Propagation},
        signature::Kind,
    };

    fn relu4d(dims: [usize; 4]) -> OpDesc {
        OpDesc::Relu {
            prop: Propagation::Forward,
            dims: dims.to_vec(),
        }
    }

    #[test]
    fn plain_plan_has_no_reorders() {
        let engine = HostEngine::default();
        let signature = Signature::builder(Kind::Relu4d).build();
        let mut plan = Plan::new(&engine, &relu4d([1, 2, 1, 2]), None, &signature).unwrap();
        assert!(plan.reorders().is_empty());
        let x = [-1f32, 1., -2., 2.];
        let mut y = [0f32; 4];
        plan.execute(&engine, &[(Role::Src, &x[..])], &mut [(Role::Dst, &mut y[..])])
            .unwrap();
        assert_eq!(y, [0., 1., 0., 2.]);
    }

    #[test]
    fn buffer_size_checked() {
        let engine = HostEngine::default();
        let signature = Signature::builder(Kind::Relu4d).build();
        let mut plan = Plan::new(&engine, &relu4d([1, 2, 1, 2]), None, &signature).unwrap();
        let x = [0f32; 4];
        let mut y = [0f32; 3];
        let error = plan
            .execute(&engine, &[(Role::Src, &x[..])], &mut [(Role::Dst, &mut y[..])])
            .unwrap_err();
        let error = error.downcast_ref::<LayerError>().unwrap();
        assert!(matches!(
            error,
            LayerError::BufferSize {
                role: Role::Dst,
                expected: 4,
                actual: 3,
            }
        ));
    }

    #[test]
    fn ensure_builds_once() {
        let mut slot = None;
        let engine = HostEngine::default();
        let signature = Signature::builder(Kind::Relu4d).build();
        let build = || Plan::new(&engine, &relu4d([1, 1, 1, 1]), None, &signature);
        ensure(&mut slot, build).unwrap();
        ensure(&mut slot, || unreachable!()).unwrap();
        assert_eq!(engine.primitive_descs_built(), 1);
    }
}
