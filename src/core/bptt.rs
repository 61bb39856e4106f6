//! Cross-entropy loss and backpropagation through time.

use ndarray::{s, Array2, Axis};

use super::{Parameters, RnnError, RnnResult, SequenceModel};
use crate::utils::{d_sigmoid_from_output, d_tanh_from_output, log_softmax_rows};

impl SequenceModel {
    fn check_targets(&self, inputs: &Array2<usize>, targets: &Array2<usize>) -> RnnResult<()> {
        if inputs.dim() != targets.dim() {
            return Err(RnnError::ShapeMismatch(format!(
                "inputs {:?} and targets {:?} differ",
                inputs.dim(),
                targets.dim()
            )));
        }
        if inputs.is_empty() {
            return Err(RnnError::ShapeMismatch("empty batch".to_string()));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= self.config.vocab_size) {
            return Err(RnnError::ShapeMismatch(format!(
                "target index {bad} outside vocabulary of size {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// Mean sparse categorical cross-entropy over every `(row, timestep)`,
    /// computed directly from logits.
    ///
    /// # Errors
    /// `ShapeMismatch` for mismatched or out-of-vocabulary inputs/targets.
    pub fn evaluate_loss(&self, inputs: &Array2<usize>, targets: &Array2<usize>) -> RnnResult<f32> {
        self.check_targets(inputs, targets)?;
        let logits = self.forward_train(inputs)?;
        let (batch, time) = inputs.dim();
        let mut loss = 0.0;
        for t in 0..time {
            let log_probs = log_softmax_rows(&logits.slice(s![.., t, ..]).to_owned());
            for i in 0..batch {
                loss -= log_probs[[i, targets[[i, t]]]];
            }
        }
        Ok(loss / (batch * time) as f32)
    }

    /// Loss plus the gradient of that loss with respect to every parameter.
    ///
    /// The sequence is unrolled from the zero state, then errors flow back
    /// from the last timestep to the first, accumulating into a
    /// [`Parameters`]-shaped gradient.
    ///
    /// # Errors
    /// `ShapeMismatch` for mismatched or out-of-vocabulary inputs/targets.
    pub fn loss_and_gradients(
        &self,
        inputs: &Array2<usize>,
        targets: &Array2<usize>,
    ) -> RnnResult<(f32, Parameters)> {
        self.check_targets(inputs, targets)?;
        let (batch, time) = inputs.dim();
        let units = self.config.rnn_hidden_units;
        let h0 = Array2::zeros((batch, units));
        let pass = self.run(inputs, h0, true)?;

        let p = &self.params;
        let count = (batch * time) as f32;
        let mut grads = Parameters::zeros(&self.config);
        let mut loss = 0.0;
        let mut dh_next = Array2::<f32>::zeros((batch, units));

        for t in (0..time).rev() {
            let step = &pass.steps[t];

            // softmax - onehot, scaled for the mean
            let log_probs = log_softmax_rows(&pass.logits.slice(s![.., t, ..]).to_owned());
            let mut dlogits = log_probs.mapv(f32::exp);
            for i in 0..batch {
                let y = targets[[i, t]];
                loss -= log_probs[[i, y]];
                dlogits[[i, y]] -= 1.0;
            }
            dlogits /= count;

            grads.w_out += &step.h.t().dot(&dlogits);
            grads.b_out += &dlogits.sum_axis(Axis(0));
            let dh = dlogits.dot(&p.w_out.t()) + &dh_next;

            // h = z*h_prev + (1-z)*n
            let dz = &dh * &(&step.h_prev - &step.n);
            let dn = &dh * &step.z.mapv(|v| 1.0 - v);
            let mut dh_prev = &dh * &step.z;

            let da_n = &dn * &step.n.mapv(d_tanh_from_output);
            let dr = &da_n * &step.hu;
            let dhu = &da_n * &step.r;
            let da_z = &dz * &step.z.mapv(d_sigmoid_from_output);
            let da_r = &dr * &step.r.mapv(d_sigmoid_from_output);

            let x_t = step.x.t();
            let h_prev_t = step.h_prev.t();
            grads.w_z += &x_t.dot(&da_z);
            grads.w_r += &x_t.dot(&da_r);
            grads.w_n += &x_t.dot(&da_n);
            grads.u_z += &h_prev_t.dot(&da_z);
            grads.u_r += &h_prev_t.dot(&da_r);
            grads.u_n += &h_prev_t.dot(&dhu);
            grads.b_z += &da_z.sum_axis(Axis(0));
            grads.b_r += &da_r.sum_axis(Axis(0));
            grads.b_n += &da_n.sum_axis(Axis(0));

            dh_prev += &da_z.dot(&p.u_z.t());
            dh_prev += &da_r.dot(&p.u_r.t());
            dh_prev += &dhu.dot(&p.u_n.t());

            let dx = da_z.dot(&p.w_z.t()) + da_r.dot(&p.w_r.t()) + da_n.dot(&p.w_n.t());
            for (i, &idx) in inputs.column(t).iter().enumerate() {
                let mut row = grads.embedding.row_mut(idx);
                row += &dx.row(i);
            }

            dh_next = dh_prev;
        }

        Ok((loss / count, grads))
    }
}
